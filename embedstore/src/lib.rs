//! Embedstore - Embedding Store and Similarity Search
//!
//! Batch-embeds text records held in a `SQLite` table, stores the vectors
//! next to the rows, and answers nearest-neighbor queries over them.
//!
//! ## Features
//!
//! - Chunked batch embedding with per-chunk commits and retries
//! - Canonical little-endian `f32` vector storage with a fixed dimension
//! - Cosine-similarity top-N search with deterministic tie-breaking
//! - Cached neighbor lists
//! - Retrieval-augmented answers through any chat-completions endpoint
//! - OpenAI-compatible and offline hashing embedders

pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod formatter;
pub mod llm;
pub mod rag;
pub mod search;
pub mod store;

pub use cli::{Cli, Commands};
pub use config::{Config, FailurePolicy, TableConfig};
pub use driver::{DriverConfig, EmbeddingDriver, RunSummary};
pub use error::{EmbedStoreError, Result};
pub use llm::{
    EmbeddingProvider, HashingEmbedder, OpenAiEmbedder, OpenAiGenerator, TextGenerator,
    build_embedder,
};
pub use rag::{Answer, Hit, Rag, Related};
pub use search::{Neighbor, SimilaritySearch, VectorSource, cosine_similarity};
pub use store::{Record, Store, StoreStatus};
