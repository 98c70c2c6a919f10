//! Artifact sessions: one directory per run for failure screenshots.
//!
//! Sessions live under the configured artifact root and outlive the run so
//! reports and the CLI can list their captures.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// A per-run artifact directory
#[derive(Debug, Clone)]
pub struct Session {
    /// Session ID (the run id for run sessions)
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
}

impl Session {
    /// Session for a run under an artifact root
    pub fn for_run(root: impl AsRef<Path>, run_id: &str) -> Self {
        Self::in_dir(root.as_ref().join(sanitize_name(run_id)))
    }

    /// Session in a specific directory
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "session".to_string());
        Self { id, dir }
    }

    /// Create the directory and write session metadata
    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let metadata = serde_json::json!({
            "id": self.id,
            "created": chrono::Utc::now().to_rfc3339(),
        });
        fs::write(
            self.dir.join(".session.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;
        Ok(())
    }

    /// Path for a capture; repeated names get a numeric suffix
    pub fn capture_path(&self, name: &str) -> PathBuf {
        let stem = sanitize_name(name);
        let first = self.dir.join(format!("{}.png", stem));
        if !first.exists() {
            return first;
        }
        (2..)
            .map(|n| self.dir.join(format!("{}_{}.png", stem, n)))
            .find(|p| !p.exists())
            .unwrap_or(first)
    }

    /// Write a PNG screenshot into the session
    pub fn save_screenshot(&self, name: &str, png: &[u8]) -> io::Result<PathBuf> {
        if !png.starts_with(PNG_SIGNATURE) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "screenshot is not a PNG image",
            ));
        }
        if !self.dir.exists() {
            self.init()?;
        }
        let path = self.capture_path(name);
        fs::write(&path, png)?;
        debug!(path = %path.display(), "screenshot saved");
        Ok(path)
    }

    /// List all PNG files in the session
    pub fn list_captures(&self) -> io::Result<Vec<PathBuf>> {
        let mut captures = Vec::new();
        if self.dir.exists() {
            for entry in fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "png") {
                    captures.push(path);
                }
            }
        }
        captures.sort();
        Ok(captures)
    }
}

/// Sanitize a name for use in filenames
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png() -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(b"rest");
        bytes
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("failure timeout"), "failure_timeout");
        assert_eq!(sanitize_name("a/b\\c"), "a_b_c");
    }

    #[test]
    fn test_save_screenshot_numbers_repeats() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::for_run(tmp.path(), "login_20260101:120000");
        assert_eq!(session.id, "login_20260101_120000");

        let first = session.save_screenshot("failure_timeout", &png()).unwrap();
        let second = session.save_screenshot("failure_timeout", &png()).unwrap();
        assert!(first.ends_with("failure_timeout.png"));
        assert!(second.ends_with("failure_timeout_2.png"));
        assert_eq!(session.list_captures().unwrap().len(), 2);
        assert!(session.dir.join(".session.json").exists());
    }

    #[test]
    fn test_rejects_non_png() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::in_dir(tmp.path().join("run_2"));
        let err = session.save_screenshot("x", b"not a png").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_list_captures_skips_metadata_and_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::for_run(tmp.path(), "run_3");
        assert!(session.list_captures().unwrap().is_empty());

        session.save_screenshot("vision_check", &png()).unwrap();
        let captures = session.list_captures().unwrap();
        assert_eq!(captures.len(), 1);
        assert!(captures[0].ends_with("vision_check.png"));
    }
}
