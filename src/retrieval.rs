//! Knowledge retrieval for the system prompt.
//!
//! Documents live in the store with a precomputed embedding. A query is
//! embedded once, every document is scored by cosine similarity, and the best
//! matches above the threshold are joined into a single text block.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RetrievalError;
use crate::store::{Database, StoredDocument};

/// Turns text into an embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

/// A document that matched a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub id: String,
    pub content: String,
    pub similarity: f32,
}

/// Finds documentation relevant to a user question.
#[async_trait]
pub trait DocumentRetriever: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<ScoredDocument>, RetrievalError>;
}

/// Brute-force cosine search over the stored corpus.
pub struct EmbeddingRetriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn Database>,
    match_threshold: f32,
    match_count: usize,
}

impl EmbeddingRetriever {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn Database>) -> Self {
        Self {
            embedder,
            store,
            match_threshold: 0.7,
            match_count: 5,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.match_threshold = threshold;
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.match_count = count;
        self
    }
}

#[async_trait]
impl DocumentRetriever for EmbeddingRetriever {
    async fn search(&self, query: &str) -> Result<Vec<ScoredDocument>, RetrievalError> {
        if query.trim().is_empty() || self.match_count == 0 {
            return Ok(Vec::new());
        }
        let documents = self
            .store
            .list_documents()
            .await
            .map_err(|e| RetrievalError::SearchFailed {
                reason: e.to_string(),
            })?;
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(query).await?;
        Ok(rank(
            &query_embedding,
            documents,
            self.match_threshold,
            self.match_count,
        ))
    }
}

fn rank(
    query: &[f32],
    documents: Vec<StoredDocument>,
    threshold: f32,
    count: usize,
) -> Vec<ScoredDocument> {
    let mut scored: Vec<ScoredDocument> = documents
        .into_iter()
        .filter_map(|doc| {
            let similarity = cosine_similarity(query, &doc.embedding)?;
            (similarity >= threshold).then(|| ScoredDocument {
                id: doc.id,
                content: doc.content,
                similarity,
            })
        })
        .collect();
    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(count);
    scored
}

/// Cosine similarity of two vectors. `None` when dimensions differ or either
/// vector has zero length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Join matched documents into the prompt's documentation block.
pub fn format_documents(docs: &[ScoredDocument]) -> String {
    docs.iter()
        .map(|d| d.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
