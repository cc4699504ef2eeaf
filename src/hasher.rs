use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use crate::error::{SyncError, SyncResult};

pub const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Streaming MD5 of a local file, lowercase hex.
///
/// Used only to tell whether the engine already synced this version of a file.
pub fn hash_file(path: &Path) -> SyncResult<String> {
    let mut file = File::open(path).map_err(|e| SyncError::io(path, e))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SyncError::io(path, e)),
        };
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}
