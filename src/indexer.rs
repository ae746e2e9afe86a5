//! Documentation indexing.
//!
//! Walks a directory of markdown guides, splits each file into overlapping
//! chunks, embeds every chunk and stores it for retrieval. A run replaces the
//! whole corpus.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::IndexError;
use crate::retrieval::Embedder;
use crate::store::Database;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// One piece of a guide, ready to embed.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Totals for one indexing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub files_found: usize,
    pub files_indexed: usize,
    pub chunks_indexed: usize,
    pub chunks_failed: usize,
}

/// Split `text` into windows of at most `max_chars` characters, each
/// starting `overlap` characters before the previous one ended.
pub fn chunk_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let max_chars = max_chars.max(1);
    let overlap = overlap.min(max_chars - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }
    chunks
}

/// Text of the first `# ` heading, or "Untitled".
pub fn extract_title(content: &str) -> String {
    content
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix('#')?;
            if !rest.starts_with(char::is_whitespace) {
                return None;
            }
            let title = rest.trim();
            (!title.is_empty()).then(|| title.to_string())
        })
        .unwrap_or_else(|| "Untitled".to_string())
}

/// Chunk one guide. `relative` is its path under the docs root; the parent
/// directory names the category.
pub fn chunk_document(relative: &Path, content: &str) -> Vec<DocumentChunk> {
    let source = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let category = relative
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "general".to_string());
    let title = extract_title(content);

    let pieces = chunk_text(content, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP);
    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let mut metadata = json!({
                "source": source,
                "category": category,
                "title": title,
            });
            if total > 1 {
                metadata["section"] = json!(format!("Part {}/{}", i + 1, total));
            }
            DocumentChunk {
                content: piece,
                metadata,
            }
        })
        .collect()
}

/// Every `.md` file under `root`, sorted. Hidden directories are skipped.
pub async fn find_markdown_files(root: &Path) -> Result<Vec<PathBuf>, IndexError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| IndexError::Io { path, source }
    };

    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await.map_err(io(&dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(io(&dir))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(io(&path))?;
            if file_type.is_dir() {
                if !entry.file_name().to_string_lossy().starts_with('.') {
                    pending.push(path);
                }
            } else if path.extension().is_some_and(|ext| ext == "md") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Embeds guides and writes them to the document store.
pub struct DocumentIndexer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn Database>,
}

impl DocumentIndexer {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn Database>) -> Self {
        Self { embedder, store }
    }

    /// Replace the stored corpus with the guides under `root`.
    ///
    /// Only a missing or unreadable root fails the run. Unreadable files and
    /// chunks that cannot be embedded or stored are logged and counted.
    pub async fn index_directory(&self, root: &Path) -> Result<IndexReport, IndexError> {
        if !fs::metadata(root).await.is_ok_and(|m| m.is_dir()) {
            return Err(IndexError::MissingRoot(root.to_path_buf()));
        }
        let files = find_markdown_files(root).await?;
        info!(root = %root.display(), files = files.len(), "Indexing documentation");

        match self.store.clear_documents().await {
            Ok(removed) => debug!(removed, "Cleared existing documents"),
            Err(e) => warn!(error = %e, "Could not clear existing documents"),
        }

        let mut report = IndexReport {
            files_found: files.len(),
            ..Default::default()
        };
        for path in &files {
            let relative = path.strip_prefix(root).unwrap_or(path);
            let content = match fs::read_to_string(path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %relative.display(), error = %e, "Skipping unreadable file");
                    continue;
                }
            };

            let chunks = chunk_document(relative, &content);
            for chunk in &chunks {
                if self.store_chunk(chunk).await {
                    report.chunks_indexed += 1;
                } else {
                    report.chunks_failed += 1;
                }
            }
            report.files_indexed += 1;
            debug!(file = %relative.display(), chunks = chunks.len(), "Indexed file");
        }

        info!(
            files = report.files_indexed,
            found = report.files_found,
            chunks = report.chunks_indexed,
            failed = report.chunks_failed,
            "Indexing complete"
        );
        Ok(report)
    }

    async fn store_chunk(&self, chunk: &DocumentChunk) -> bool {
        let source = chunk.metadata["source"].as_str().unwrap_or_default();
        let embedding = match self.embedder.embed(&chunk.content).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(source, error = %e, "Embedding failed, chunk skipped");
                return false;
            }
        };
        match self
            .store
            .insert_document(&chunk.content, &chunk.metadata, &embedding)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(source, error = %e, "Could not store chunk");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::RetrievalError;
    use crate::retrieval::{DocumentRetriever, EmbeddingRetriever};
    use crate::store::LibSqlBackend;

    /// Embeds by keyword so retrieval can be checked end to end.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
            if text.contains("FAIL") {
                return Err(RetrievalError::EmbeddingFailed {
                    reason: "rate limited".to_string(),
                });
            }
            let lower = text.to_lowercase();
            Ok(vec![
                f32::from(u8::from(lower.contains("cpr"))),
                f32::from(u8::from(lower.contains("housing"))),
                0.1,
            ])
        }
    }

    async fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(path, content).await.unwrap();
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hej", 1000, 200), vec!["hej".to_string()]);
        assert!(chunk_text("", 1000, 200).is_empty());
    }

    #[test]
    fn chunks_overlap_and_cover_the_text() {
        let text: String = ('a'..='z').cycle().take(2500).collect();
        let chunks = chunk_text(&text, 1000, 200);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 1000);
        assert_eq!(chunks[1].chars().count(), 1000);
        assert_eq!(chunks[2].chars().count(), 900);

        let tail: String = chunks[0].chars().skip(800).collect();
        let head: String = chunks[1].chars().take(200).collect();
        assert_eq!(tail, head);
        assert!(text.ends_with(chunks[2].as_str()));
    }

    #[test]
    fn chunking_counts_characters_not_bytes() {
        let text = "æøå".repeat(500);
        let chunks = chunk_text(&text, 1000, 200);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 1000);
        assert_eq!(chunks[1].chars().count(), 700);
    }

    #[test]
    fn overlap_wider_than_window_still_advances() {
        let chunks = chunk_text("abcdef", 2, 5);
        assert_eq!(chunks, vec!["ab", "bc", "cd", "de", "ef"]);
    }

    #[test]
    fn title_is_first_level_one_heading() {
        assert_eq!(extract_title("intro\n## Sub\n# Getting a CPR number\n"), "Getting a CPR number");
        assert_eq!(extract_title("#NoSpace\nplain text"), "Untitled");
        assert_eq!(extract_title("#   \n"), "Untitled");
    }

    #[test]
    fn metadata_names_source_category_and_part() {
        let chunks = chunk_document(Path::new("arrival/cpr.md"), "# CPR\nShort guide.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].metadata,
            json!({ "source": "arrival/cpr.md", "category": "arrival", "title": "CPR" })
        );

        let long = format!("# Housing\n{}", "x".repeat(1500));
        let chunks = chunk_document(Path::new("housing.md"), &long);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata["category"], "general");
        assert_eq!(chunks[0].metadata["section"], "Part 1/2");
        assert_eq!(chunks[1].metadata["section"], "Part 2/2");
        assert_eq!(chunks[1].metadata["title"], "Housing");
    }

    #[tokio::test]
    async fn finds_markdown_recursively_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.md", "b").await;
        write(dir.path(), "arrival/a.md", "a").await;
        write(dir.path(), "arrival/notes.txt", "skip").await;
        write(dir.path(), ".drafts/hidden.md", "skip").await;

        let files = find_markdown_files(dir.path()).await.unwrap();
        let relative: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            relative,
            vec![PathBuf::from("arrival/a.md"), PathBuf::from("b.md")]
        );
    }

    #[tokio::test]
    async fn indexing_replaces_corpus_and_feeds_retrieval() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "arrival/cpr.md", "# CPR\nBook a CPR appointment.").await;
        write(dir.path(), "housing/rent.md", "# Housing\nHousing deposits are common.").await;
        write(dir.path(), "broken.md", "# Broken\nFAIL").await;

        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .insert_document("stale", &json!({}), &[1.0, 0.0, 0.0])
            .await
            .unwrap();

        let indexer = DocumentIndexer::new(Arc::new(KeywordEmbedder), Arc::clone(&store));
        let report = indexer.index_directory(dir.path()).await.unwrap();
        assert_eq!(
            report,
            IndexReport {
                files_found: 3,
                files_indexed: 3,
                chunks_indexed: 2,
                chunks_failed: 1,
            }
        );

        let docs = store.list_documents().await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.content != "stale"));

        let retriever = EmbeddingRetriever::new(Arc::new(KeywordEmbedder), Arc::clone(&store));
        let hits = retriever.search("How do I get a CPR number?").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("Book a CPR appointment."));
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let indexer = DocumentIndexer::new(Arc::new(KeywordEmbedder), store);
        let err = indexer
            .index_directory(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::MissingRoot(_)));
    }
}
