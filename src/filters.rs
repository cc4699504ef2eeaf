use std::path::Path;

/// Marker embedded in download temp file names; see `reconcile::temp_path_for`.
pub const DOWNLOAD_TEMP_MARKER: &str = ".drivesync-tmp-";

/// Lock file kept in the local root while an engine owns it.
pub const LOCK_FILE_NAME: &str = ".drivesync.lock";

/// Filename-suffix ignore rules, applied to local events and remote listings alike.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    suffixes: Vec<String>,
}

impl IgnoreList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Self { suffixes }
    }

    /// True when `name` (a bare filename) must never be synced.
    pub fn is_ignored_name(&self, name: &str) -> bool {
        if is_engine_artifact(name) {
            return true;
        }
        self.suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }

    /// Applies the rules to the final component of `path`.
    pub fn is_ignored_path(&self, path: &Path) -> bool {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => self.is_ignored_name(name),
            None => true,
        }
    }
}

// Files the engine itself creates inside the local root.
fn is_engine_artifact(name: &str) -> bool {
    name == LOCK_FILE_NAME || name.contains(DOWNLOAD_TEMP_MARKER)
}
