use std::{cmp::Ordering, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use futures::TryStreamExt;
use log::{debug, warn};
use serde::Serialize;

use crate::{embedding::worker::InferenceWorker, store::EmbeddingStore, watch::WatchedFolders};

pub use error::SearchError;

/// What the search engine needs to know about the request it is answering.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Prefix for display URLs, eg. `http://localhost:8000/images`
    pub base_url: String,
}

impl RequestContext {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub path: Utf8PathBuf,
    /// Cosine similarity rescaled to [0, 1]
    pub score: f32,
    pub display_url: String,
}

/// Brute-force similarity search over every stored embedding.
///
/// Each call reads the store afresh, so results reflect whatever has been persisted so far, including the
/// partial output of an indexing run still in progress.
pub struct SearchEngine {
    store: Arc<EmbeddingStore>,
    worker: InferenceWorker,
    folders: Arc<WatchedFolders>,
}

impl SearchEngine {
    pub fn new(store: Arc<EmbeddingStore>, worker: InferenceWorker, folders: Arc<WatchedFolders>) -> Self {
        Self { store, worker, folders }
    }

    pub async fn search(&self, query: &str, top_k: usize, context: &RequestContext)
        -> Result<Vec<SearchResult>, SearchError> {
        if top_k == 0 || self.store.count().await? == 0 {
            return Ok(vec![]);
        }

        debug!("Embedding query: {}", query);
        let vector = self.worker.embed_text(query).await?;
        self.search_by_vector(&vector, top_k, context).await
    }

    pub async fn search_by_vector(&self, query: &[f32], top_k: usize, context: &RequestContext)
        -> Result<Vec<SearchResult>, SearchError> {
        if top_k == 0 {
            return Ok(vec![]);
        }

        let mut scored: Vec<(Utf8PathBuf, f32)> = self.store.all().await?
            .map_ok(|(path, embedding)| {
                let similarity = cosine_similarity(query, &embedding);
                (path, similarity)
            })
            .try_collect().await?;

        rank(&mut scored, top_k);

        let active = self.folders.active();
        Ok(scored.into_iter()
            .map(|(path, similarity)| {
                let display = display_path(&path, active.as_deref());
                SearchResult {
                    display_url: display_url(&context.base_url, &display),
                    score: normalized_score(similarity),
                    path,
                }
            })
            .collect())
    }
}

/// Stable descending sort on similarity followed by truncation. Equal similarities keep store order.
pub fn rank(scored: &mut Vec<(Utf8PathBuf, f32)>, top_k: usize) {
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(top_k);
}

/// `dot(a, b) / (|a| |b|)`. Zero-norm vectors and vectors of different lengths have similarity 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Maps cosine range [-1, 1] onto [0, 1].
pub fn normalized_score(similarity: f32) -> f32 {
    if similarity.is_nan() {
        return 0.0;
    }
    ((similarity + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Path relative to the active folder, or the bare file name when the path is not under it.
pub fn display_path(path: &Utf8Path, active_folder: Option<&Utf8Path>) -> Utf8PathBuf {
    if let Some(relative) = active_folder.and_then(|folder| path.strip_prefix(folder).ok()) {
        return relative.to_owned();
    }

    warn!("{} is not under the active folder {:?}, displaying its file name only", path, active_folder);
    path.file_name().map(Utf8PathBuf::from).unwrap_or_else(|| path.to_owned())
}

pub fn display_url(base_url: &str, display_path: &Utf8Path) -> String {
    let encoded: Vec<String> = display_path.components()
        .map(|c| c.as_str())
        .filter(|segment| !segment.is_empty() && *segment != "/")
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", base_url.trim_end_matches('/'), encoded.join("/"))
}

pub mod error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-2.0, 0.0]) + 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[3.0, 4.0], &[3.0, 4.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn scores_stay_in_bounds() {
        assert_eq!(normalized_score(-1.0), 0.0);
        assert_eq!(normalized_score(1.0), 1.0);
        assert_eq!(normalized_score(1.0000002), 1.0);
        assert_eq!(normalized_score(0.5), 0.75);
        assert_eq!(normalized_score(f32::NAN), 0.0);
    }

    #[test]
    fn ties_keep_store_order() {
        let mut scored = vec![
            (Utf8PathBuf::from("first"), 0.5),
            (Utf8PathBuf::from("best"), 0.9),
            (Utf8PathBuf::from("second"), 0.5),
            (Utf8PathBuf::from("third"), 0.5),
        ];
        rank(&mut scored, 3);
        let order: Vec<_> = scored.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(order, vec!["best", "first", "second"]);
    }

    #[test]
    fn display_path_falls_back_to_file_name() {
        let active = Utf8Path::new("/home/me/pics");
        assert_eq!(display_path(Utf8Path::new("/home/me/pics/trips/a.jpg"), Some(active)),
            Utf8PathBuf::from("trips/a.jpg"));
        assert_eq!(display_path(Utf8Path::new("/elsewhere/b.jpg"), Some(active)), Utf8PathBuf::from("b.jpg"));
        assert_eq!(display_path(Utf8Path::new("/elsewhere/b.jpg"), None), Utf8PathBuf::from("b.jpg"));
    }

    #[test]
    fn display_url_encodes_segments() {
        assert_eq!(display_url("http://host/images/", Utf8Path::new("summer trip/a&b #1.jpg")),
            "http://host/images/summer%20trip/a%26b%20%231.jpg");
        assert_eq!(display_url("", Utf8Path::new("c.png")), "/c.png");
    }
}
