//! Retrieval on top of the store, and retrieval-augmented answers.

use crate::error::{EmbedStoreError, Result};
use crate::llm::{EmbeddingProvider, TextGenerator};
use crate::search::{Neighbor, SimilaritySearch};
use crate::store::{Record, Store};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use tracing::debug;

/// Characters of each record included in a prompt.
const MAX_CONTEXT_CHARS: usize = 1000;

/// A ranked record with its text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    /// Record id.
    pub id: i64,
    /// Cosine similarity.
    pub score: f32,
    /// Text fields.
    pub texts: Vec<String>,
}

/// Records related to one text match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Related {
    /// The record that matched the term.
    pub record: Record,
    /// Its nearest neighbors.
    pub neighbors: Vec<Hit>,
}

/// A generated answer and the records it was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    /// Generated text.
    pub text: String,
    /// Context records, best first.
    pub sources: Vec<Hit>,
}

/// Attach text to neighbors, keeping score order.
///
/// `fetch_by_ids` does not preserve order, so rows are re-sorted here.
pub fn hits_for(store: &Store, neighbors: &[Neighbor]) -> Result<Vec<Hit>> {
    let ids: Vec<i64> = neighbors.iter().map(|n| n.id).collect();
    let mut rows: HashMap<i64, Record> = store
        .fetch_by_ids(&ids)?
        .into_iter()
        .map(|r| (r.id, r))
        .collect();
    Ok(neighbors
        .iter()
        .filter_map(|n| {
            rows.remove(&n.id).map(|r| Hit {
                id: n.id,
                score: n.score,
                texts: r.texts,
            })
        })
        .collect())
}

/// The `n` records nearest to a stored record.
pub fn related(store: &Store, id: i64, n: usize) -> Result<Vec<Hit>> {
    let neighbors = SimilaritySearch::new(store).top_n_for_existing(id, n)?;
    hits_for(store, &neighbors)
}

/// Records containing `term` (up to `limit`), each with its `per_match`
/// nearest neighbors. Matches without a vector are skipped.
pub fn related_to_term(
    store: &Store,
    term: &str,
    limit: usize,
    per_match: usize,
) -> Result<Vec<Related>> {
    let matches = store.search_text(term, limit)?;
    debug!(term, matches = matches.len(), "text matches");

    let search = SimilaritySearch::new(store);
    let mut out = Vec::with_capacity(matches.len());
    for record in matches {
        let Some(vector) = store.vector(record.id)? else {
            continue;
        };
        let neighbors = search.top_n(&vector, per_match, &HashSet::from([record.id]))?;
        out.push(Related {
            neighbors: hits_for(store, &neighbors)?,
            record,
        });
    }
    Ok(out)
}

/// Build the grounded prompt for `question`.
#[must_use]
pub fn build_prompt(question: &str, hits: &[Hit]) -> String {
    let mut context = String::new();
    for hit in hits {
        let text: String = hit
            .texts
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let truncated: String = text.chars().take(MAX_CONTEXT_CHARS).collect();
        let _ = write!(
            context,
            "\n--- Record {} (relevance {:.4}) ---\n{}\n",
            hit.id, hit.score, truncated
        );
    }

    format!(
        r"Based on the following records, answer the question concisely and accurately.
Use only the information in the records.

Records:
{context}
Question: {question}

Answer:"
    )
}

/// Query-side retrieval and question answering.
pub struct Rag<'a> {
    /// Record store.
    store: &'a Store,
    /// Provider used to embed queries; must match the one used for records.
    embedder: &'a dyn EmbeddingProvider,
}

impl std::fmt::Debug for Rag<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rag")
            .field("model", &self.embedder.model())
            .finish_non_exhaustive()
    }
}

impl<'a> Rag<'a> {
    /// Retrieval over `store` with queries embedded by `embedder`.
    pub fn new(store: &'a Store, embedder: &'a dyn EmbeddingProvider) -> Self {
        Self { store, embedder }
    }

    /// The `n` records most similar to free text.
    pub fn search(&self, query: &str, n: usize) -> Result<Vec<Hit>> {
        let vector = self
            .embedder
            .embed(&[query.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedStoreError::Provider("no embedding returned for query".into()))?;
        let neighbors = SimilaritySearch::new(self.store).top_n(&vector, n, &HashSet::new())?;
        hits_for(self.store, &neighbors)
    }

    /// Answer `question` from the `n` most relevant records.
    pub fn ask(&self, generator: &dyn TextGenerator, question: &str, n: usize) -> Result<Answer> {
        let sources = self.search(question, n)?;
        let prompt = build_prompt(question, &sources);
        debug!(
            model = generator.model(),
            sources = sources.len(),
            prompt_chars = prompt.len(),
            "asking generator"
        );
        let text = generator.complete(&prompt)?;
        Ok(Answer { text, sources })
    }
}
