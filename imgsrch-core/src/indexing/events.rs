use camino::Utf8PathBuf;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

/// Lifecycle and progress notifications of an indexing run, in the order they are emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum IndexingEvent {
    #[serde(rename = "indexing_started")]
    Started { folder: Utf8PathBuf },
    #[serde(rename = "indexing_progress")]
    Progress {
        folder: Utf8PathBuf,
        current_file: Option<Utf8PathBuf>,
        processed: usize,
        total: usize,
        percentage: f64,
    },
    #[serde(rename = "indexing_completed")]
    Completed { folder: Utf8PathBuf, total_indexed: usize, skipped: usize, message: String },
    #[serde(rename = "indexing_error")]
    Error { folder: Utf8PathBuf, error: String },
}

/// Receiver of indexing events. Emitting never fails the run; sinks drop events they cannot deliver.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: IndexingEvent);
}

/// Sink that discards everything.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: IndexingEvent) {}
}

// Fan out to every connected client. No subscribers is not an error.
impl EventSink for broadcast::Sender<IndexingEvent> {
    fn emit(&self, event: IndexingEvent) {
        let _ = self.send(event);
    }
}

impl EventSink for mpsc::UnboundedSender<IndexingEvent> {
    fn emit(&self, event: IndexingEvent) {
        let _ = self.send(event);
    }
}

impl<F> EventSink for F
where
    F: Fn(IndexingEvent) + Send + Sync,
{
    fn emit(&self, event: IndexingEvent) {
        self(event)
    }
}
