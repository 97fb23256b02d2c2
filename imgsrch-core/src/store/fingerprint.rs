use std::{fs::File, io::{self, BufReader}};

use camino::Utf8Path;
use chrono::{DateTime, Utc};

/// Content fingerprint and modification time of a file on disk, as used for staleness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    /// Lowercase hex MD5 digest of the file bytes
    pub fingerprint: String,
    pub modified: DateTime<Utc>,
}

impl FileState {
    /// Reads and hashes the file. Blocking; call from a blocking context.
    pub fn read(path: &Utf8Path) -> io::Result<FileState> {
        let file = File::open(path)?;
        let modified = DateTime::<Utc>::from(file.metadata()?.modified()?);

        let mut context = md5::Context::new();
        io::copy(&mut BufReader::new(file), &mut context)?;

        Ok(FileState {
            fingerprint: format!("{:x}", context.compute()),
            modified,
        })
    }

    /// Whether a record holding `stored_fingerprint` and `stored_modified` is out of date with respect to this
    /// state. Either a different fingerprint or a strictly newer modification time (millisecond precision,
    /// the precision records are stored at) is enough.
    pub fn is_newer_than(&self, stored_fingerprint: &str, stored_modified: &DateTime<Utc>) -> bool {
        self.fingerprint != stored_fingerprint
            || self.modified.timestamp_millis() > stored_modified.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;
    use chrono::Duration;

    use super::*;

    #[test]
    fn fingerprint_is_md5_of_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("hello.txt")).unwrap();
        fs::write(&path, b"hello world").unwrap();

        let state = FileState::read(&path).unwrap();
        assert_eq!(state.fingerprint, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(FileState::read(Utf8Path::new("/definitely/not/here.png")).is_err());
    }

    #[test]
    fn either_signal_marks_stale() {
        let now = Utc::now();
        let state = FileState { fingerprint: "abc".to_owned(), modified: now };

        assert!(!state.is_newer_than("abc", &now));
        assert!(state.is_newer_than("abd", &now));
        assert!(state.is_newer_than("abc", &(now - Duration::seconds(5))));
        // an older file on disk than the record is not stale by itself
        assert!(!state.is_newer_than("abc", &(now + Duration::seconds(5))));
    }
}
