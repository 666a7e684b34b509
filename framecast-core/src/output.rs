use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::Result;

pub const OUTPUT_EXTENSION: &str = "mp4";

/// Names and places rendered files.
///
/// Every destination carries a millisecond timestamp so renders running at
/// the same time never write to the same path.
#[derive(Debug, Clone)]
pub struct OutputManager {
    dir: PathBuf,
}

impl OutputManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<name>_<YYYYmmdd_HHMMSS_mmm>.mp4`, creating `dir` if needed.
    pub fn destination(&self, name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        Ok(self
            .dir
            .join(format!("{}_{stamp}.{OUTPUT_EXTENSION}", sanitize_name(name))))
    }
}

/// Keeps ASCII letters, digits, `-` and `_`; everything else becomes `_`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "render".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use tempfile::TempDir;

    #[test]
    fn destination_is_timestamped_inside_dir() {
        let root = TempDir::new().unwrap();
        let manager = OutputManager::new(root.path().join("output"));
        let dest = manager.destination("Happy Birthday Sam").unwrap();

        assert!(manager.dir().is_dir());
        assert_eq!(dest.parent(), Some(manager.dir()));
        let file = dest.file_name().unwrap().to_string_lossy().into_owned();
        let pattern = Regex::new(r"^Happy_Birthday_Sam_\d{8}_\d{6}_\d{3}\.mp4$").unwrap();
        assert!(pattern.is_match(&file), "{file}");
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_name("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_name("  "), "render");
        assert_eq!(sanitize_name("ok-name_1"), "ok-name_1");
    }
}
