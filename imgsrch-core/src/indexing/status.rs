use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use log::warn;
use serde::Serialize;

const INTERRUPTED: &str = "indexing interrupted";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub current_file: Option<Utf8PathBuf>,
    pub processed_count: usize,
    pub total_count: usize,
    /// 0 to 100
    pub percentage: f64,
}

/// Snapshot of the process-wide indexing state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexingStatus {
    pub is_indexing: bool,
    pub current_folder: Option<Utf8PathBuf>,
    pub progress: Progress,
    pub last_completed: Option<Utf8PathBuf>,
    pub error: Option<String>,
}

/// Shared indexing state, and the gate that keeps more than one indexing run from happening at a time.
///
/// Share one tracker (behind an `Arc`) between everything that may start indexing. Reads hand out copies.
#[derive(Debug, Default)]
pub struct StatusTracker {
    inner: Mutex<IndexingStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `folder` as being indexed, unless a run is already in flight. On conflict returns the folder
    /// currently being indexed and changes nothing.
    ///
    /// The gate stays closed for as long as the returned guard lives. A guard dropped without
    /// [`IndexingGuard::finish`] or [`IndexingGuard::fail`] (a cancelled future, a panic) records the run as
    /// interrupted and reopens the gate.
    pub fn try_begin(&self, folder: &Utf8Path) -> Result<IndexingGuard<'_>, Utf8PathBuf> {
        let mut status = self.lock();
        if status.is_indexing {
            return Err(status.current_folder.clone().unwrap_or_default());
        }
        status.is_indexing = true;
        status.current_folder = Some(folder.to_owned());
        status.error = None;
        Ok(IndexingGuard { tracker: self, folder: folder.to_owned(), released: false })
    }

    pub fn set_status(&self, is_indexing: bool, folder: Option<&Utf8Path>, error: Option<String>) {
        let mut status = self.lock();
        status.is_indexing = is_indexing;
        status.current_folder = folder.map(Utf8Path::to_owned);
        status.error = error;
    }

    pub fn update_progress(&self, current_file: Option<&Utf8Path>, processed: usize, total: usize) {
        let mut status = self.lock();
        status.progress = Progress {
            current_file: current_file.map(Utf8Path::to_owned),
            processed_count: processed,
            total_count: total,
            percentage: percentage(processed, total),
        };
    }

    pub fn reset_progress(&self) {
        self.lock().progress = Progress::default();
    }

    pub fn get_status(&self) -> IndexingStatus {
        self.lock().clone()
    }

    pub fn is_indexing(&self) -> bool {
        self.lock().is_indexing
    }

    /// Ends a successful run over `folder`.
    pub fn finish(&self, folder: &Utf8Path) {
        let mut status = self.lock();
        status.is_indexing = false;
        status.current_folder = None;
        status.last_completed = Some(folder.to_owned());
        status.error = None;
    }

    /// Ends a failed run, keeping the folder and error for inspection.
    pub fn fail(&self, folder: &Utf8Path, error: String) {
        self.set_status(false, Some(folder), Some(error));
    }

    // A panic elsewhere while holding the lock leaves plain data behind, still usable
    fn lock(&self) -> MutexGuard<'_, IndexingStatus> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held while an indexing run owns the [`StatusTracker`] gate.
#[must_use = "the indexing gate reopens as soon as the guard is dropped"]
#[derive(Debug)]
pub struct IndexingGuard<'a> {
    tracker: &'a StatusTracker,
    folder: Utf8PathBuf,
    released: bool,
}

impl IndexingGuard<'_> {
    pub fn folder(&self) -> &Utf8Path {
        &self.folder
    }

    pub fn is_held_on(&self, tracker: &StatusTracker) -> bool {
        std::ptr::eq(self.tracker, tracker)
    }

    /// Moves the run on to `folder` without reopening the gate.
    pub fn switch_to(&mut self, folder: &Utf8Path) {
        self.folder = folder.to_owned();
        self.tracker.lock().current_folder = Some(folder.to_owned());
    }

    /// Records the current folder as completed while keeping the gate closed.
    pub fn complete_folder(&self) {
        let mut status = self.tracker.lock();
        status.last_completed = Some(self.folder.clone());
        status.error = None;
    }

    pub fn finish(mut self) {
        self.released = true;
        self.tracker.finish(&self.folder);
    }

    pub fn fail(mut self, error: String) {
        self.released = true;
        self.tracker.fail(&self.folder, error);
    }
}

impl Drop for IndexingGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!("Indexing of {} ended without finishing", self.folder);
            self.tracker.fail(&self.folder, INTERRUPTED.to_owned());
        }
    }
}

pub fn percentage(processed: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        (processed as f64 / total as f64 * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_until_finished() {
        let tracker = StatusTracker::new();
        let gate = tracker.try_begin(Utf8Path::new("/a")).unwrap();

        let conflict = tracker.try_begin(Utf8Path::new("/b")).unwrap_err();
        assert_eq!(conflict, Utf8PathBuf::from("/a"));
        assert_eq!(tracker.get_status().current_folder, Some(Utf8PathBuf::from("/a")));

        gate.finish();
        assert!(tracker.try_begin(Utf8Path::new("/b")).is_ok());
    }

    #[test]
    fn dropped_guard_reopens_the_gate() {
        let tracker = StatusTracker::new();
        drop(tracker.try_begin(Utf8Path::new("/a")).unwrap());

        let status = tracker.get_status();
        assert!(!status.is_indexing);
        assert_eq!(status.error.as_deref(), Some("indexing interrupted"));
        assert_eq!(status.last_completed, None);
        assert!(tracker.try_begin(Utf8Path::new("/b")).is_ok());
    }

    #[test]
    fn guard_can_span_several_folders() {
        let tracker = StatusTracker::new();
        let mut gate = tracker.try_begin(Utf8Path::new("/a")).unwrap();
        gate.complete_folder();
        gate.switch_to(Utf8Path::new("/b"));

        let status = tracker.get_status();
        assert!(status.is_indexing);
        assert_eq!(status.current_folder, Some(Utf8PathBuf::from("/b")));
        assert_eq!(status.last_completed, Some(Utf8PathBuf::from("/a")));
        assert!(tracker.try_begin(Utf8Path::new("/c")).is_err());

        gate.finish();
        assert_eq!(tracker.get_status().last_completed, Some(Utf8PathBuf::from("/b")));
        assert!(!tracker.is_indexing());
    }

    #[test]
    fn snapshots_are_copies() {
        let tracker = StatusTracker::new();
        let mut snapshot = tracker.get_status();
        snapshot.is_indexing = true;
        snapshot.progress.processed_count = 7;

        assert_eq!(tracker.get_status(), IndexingStatus::default());
    }

    #[test]
    fn fail_records_error_and_finish_clears_it() {
        let tracker = StatusTracker::new();
        tracker.try_begin(Utf8Path::new("/a")).unwrap().fail("disk on fire".to_owned());

        let status = tracker.get_status();
        assert!(!status.is_indexing);
        assert_eq!(status.error.as_deref(), Some("disk on fire"));

        tracker.try_begin(Utf8Path::new("/a")).unwrap().finish();
        let status = tracker.get_status();
        assert_eq!(status.error, None);
        assert_eq!(status.last_completed, Some(Utf8PathBuf::from("/a")));
    }

    #[test]
    fn progress_percentage() {
        let tracker = StatusTracker::new();
        tracker.update_progress(Some(Utf8Path::new("/a/x.png")), 1, 4);
        assert_eq!(tracker.get_status().progress.percentage, 25.0);

        tracker.reset_progress();
        assert_eq!(tracker.get_status().progress, Progress::default());
        assert_eq!(percentage(0, 0), 100.0);
    }
}
