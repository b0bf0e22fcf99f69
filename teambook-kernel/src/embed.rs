//! Optional vector index for semantic recall.
//!
//! The encoder seam is a trait; without one configured, recall degrades to
//! FTS/LIKE plus graph ranking and never short-circuits to empty. The
//! built-in encoder is a deterministic token-hash projection: useful for
//! exercising the vector path, not a learned embedding.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use teambook_core::{NoteId, RecordIdType};
use tracing::debug;

pub const EMBED_DIM: usize = 64;

/// Deterministic text encoder.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Token-hash projection: each token bumps a dimension chosen by its hash,
/// then the vector is L2-normalized. Deterministic across runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashEmbedder;

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; EMBED_DIM];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 2)
        {
            let digest = Sha256::digest(token.as_bytes());
            let dim = (digest[0] as usize) % EMBED_DIM;
            let sign = if digest[1] & 1 == 0 { 1.0 } else { -1.0 };
            vector[dim] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[derive(Default, Serialize, Deserialize)]
struct IndexFile {
    vectors: HashMap<String, Vec<f32>>,
}

/// File-backed vector index keyed by `note_{id}`.
pub struct VectorIndex {
    path: PathBuf,
    vectors: HashMap<String, Vec<f32>>,
}

impl VectorIndex {
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("index.json");
        let vectors = std::fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<IndexFile>(&raw).ok())
            .map(|file| file.vectors)
            .unwrap_or_default();
        Ok(Self { path, vectors })
    }

    pub fn upsert(&mut self, note_id: NoteId, vector: Vec<f32>) {
        self.vectors.insert(format!("note_{}", note_id), vector);
        self.flush();
    }

    pub fn remove(&mut self, note_id: NoteId) {
        self.vectors.remove(&format!("note_{}", note_id));
        self.flush();
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Cosine search; returns `(note_id, score)` best-first.
    pub fn search(&self, query: &[f32], limit: usize) -> Vec<(NoteId, f64)> {
        let mut scored: Vec<(NoteId, f64)> = self
            .vectors
            .iter()
            .filter_map(|(key, vector)| {
                let id = key.strip_prefix("note_")?.parse::<i64>().ok()?;
                Some((NoteId::new(id), cosine(query, vector)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    fn flush(&self) {
        let file = IndexFile {
            vectors: self.vectors.clone(),
        };
        if let Ok(raw) = serde_json::to_vec(&file) {
            if let Err(err) = std::fs::write(&self.path, raw) {
                debug!(error = %err, "vector index flush failed");
            }
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_deterministic() {
        let embedder = HashEmbedder;
        assert_eq!(embedder.embed("redis caching"), embedder.embed("redis caching"));
    }

    #[test]
    fn test_similar_text_scores_higher() {
        let embedder = HashEmbedder;
        let query = embedder.embed("database connection pool");
        let close = embedder.embed("connection pool for the database");
        let far = embedder.embed("birds migrate in autumn skies");
        assert!(cosine(&query, &close) > cosine(&query, &far));
    }

    #[test]
    fn test_index_roundtrip_and_search() {
        let dir = tempfile::tempdir().expect("tempdir");
        let embedder = HashEmbedder;
        {
            let mut index = VectorIndex::open(dir.path()).expect("open");
            index.upsert(NoteId::new(1), embedder.embed("rust async runtime"));
            index.upsert(NoteId::new(2), embedder.embed("gardening tips for spring"));
        }
        let index = VectorIndex::open(dir.path()).expect("reopen");
        assert_eq!(index.len(), 2);
        let hits = index.search(&embedder.embed("async rust"), 1);
        assert_eq!(hits[0].0, NoteId::new(1));
    }
}
