//! External model collaborators: embedding providers and text generators.
//!
//! HTTP implementations speak the OpenAI-compatible API, which Ollama and
//! the llama.cpp server also serve. Every request carries a timeout so a
//! stuck call cannot hang a run.

use crate::config::{EmbeddingSettings, GenerationSettings, ProviderKind, api_key};
use crate::error::{EmbedStoreError, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Turns a batch of texts into vectors.
pub trait EmbeddingProvider {
    /// One vector per input, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Model identifier, for logs and summaries.
    fn model(&self) -> &str;
}

/// Completes a prompt.
pub trait TextGenerator {
    /// Response text for `prompt`.
    fn complete(&self, prompt: &str) -> Result<String>;

    /// Model identifier.
    fn model(&self) -> &str;
}

/// Build the embedding provider selected in the config.
pub fn build_embedder(settings: &EmbeddingSettings) -> Result<Box<dyn EmbeddingProvider>> {
    Ok(match settings.provider {
        ProviderKind::OpenAi => Box::new(OpenAiEmbedder::new(settings)?),
        ProviderKind::Hashing => Box::new(HashingEmbedder::new(settings.dimensions)?),
    })
}

/// Join a base URL and an endpoint path.
fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{path}", base.trim_end_matches('/'))
}

/// Body of a failed response, for error messages.
fn error_body(response: reqwest::blocking::Response) -> String {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    format!("{status}: {}", body.trim())
}

/// `/embeddings` request.
#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    /// Model name.
    model: &'a str,
    /// Batch of inputs.
    input: &'a [String],
}

/// `/embeddings` response.
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    /// One entry per input.
    data: Vec<EmbeddingData>,
}

/// One embedding in a response.
#[derive(Debug, Deserialize)]
struct EmbeddingData {
    /// Position of the input this belongs to.
    index: usize,
    /// The vector.
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    /// Vectors in input order, checked against the input count.
    fn into_vectors(mut self, expected: usize) -> Result<Vec<Vec<f32>>> {
        if self.data.len() != expected {
            return Err(EmbedStoreError::Provider(format!(
                "expected {expected} embeddings, got {}",
                self.data.len()
            )));
        }
        self.data.sort_by_key(|d| d.index);
        if self.data.iter().enumerate().any(|(i, d)| d.index != i) {
            return Err(EmbedStoreError::Provider(
                "response indexes do not cover the batch".into(),
            ));
        }
        if self
            .data
            .iter()
            .any(|d| d.embedding.iter().any(|x| !x.is_finite()))
        {
            return Err(EmbedStoreError::Provider(
                "response contains non-finite values".into(),
            ));
        }
        Ok(self.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Embedding provider for an OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug)]
pub struct OpenAiEmbedder {
    /// HTTP client with the request timeout applied.
    client: Client,
    /// Full endpoint URL.
    url: String,
    /// Model name.
    model: String,
    /// Bearer token.
    api_key: Option<String>,
}

impl OpenAiEmbedder {
    /// Build from settings; the API key is read from the environment now.
    pub fn new(settings: &EmbeddingSettings) -> Result<Self> {
        let client = Client::builder().timeout(settings.timeout()).build()?;
        Ok(Self {
            client,
            url: endpoint(&settings.base_url, "embeddings"),
            model: settings.model.clone(),
            api_key: api_key(settings.api_key_env.as_deref()),
        })
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut request = self.client.post(&self.url).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(EmbedStoreError::Provider(error_body(response)));
        }
        let parsed: EmbeddingResponse = response.json()?;
        debug!(model = %self.model, inputs = texts.len(), "embedding batch");
        parsed.into_vectors(texts.len())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Offline embedder using the hashing trick.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into a signed
/// bucket; the bag is L2-normalised. Deterministic and dependency-free at
/// run time, so texts sharing words land near each other.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    /// Output dimensions.
    dimensions: usize,
}

impl HashingEmbedder {
    /// Embedder producing `dimensions`-long vectors.
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(EmbedStoreError::Config(
                "embedding.dimensions must be positive".into(),
            ));
        }
        Ok(Self { dimensions })
    }

    /// Embed one text.
    #[must_use]
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            #[allow(clippy::cast_possible_truncation)]
            let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model(&self) -> &str {
        "hashing"
    }
}

/// `/chat/completions` request.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    /// Model name.
    model: &'a str,
    /// Conversation; a single user turn here.
    messages: Vec<ChatMessage>,
    /// Completion token cap.
    max_tokens: u32,
}

/// One chat message.
#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    /// `user`, `assistant` or `system`.
    role: String,
    /// Text content.
    content: String,
}

/// `/chat/completions` response.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    /// Alternatives; the first one is used.
    choices: Vec<ChatChoice>,
}

/// One alternative.
#[derive(Debug, Deserialize)]
struct ChatChoice {
    /// Generated message.
    message: ChatMessage,
}

impl ChatResponse {
    /// Text of the first choice.
    fn into_text(self) -> Result<String> {
        self.choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EmbedStoreError::Generation("empty completion".into()))
    }
}

/// Text generator for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug)]
pub struct OpenAiGenerator {
    /// HTTP client with the request timeout applied.
    client: Client,
    /// Full endpoint URL.
    url: String,
    /// Model name.
    model: String,
    /// Bearer token.
    api_key: Option<String>,
    /// Completion token cap.
    max_tokens: u32,
}

impl OpenAiGenerator {
    /// Build from settings.
    pub fn new(settings: &GenerationSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| EmbedStoreError::Generation(e.to_string()))?;
        Ok(Self {
            client,
            url: endpoint(&settings.base_url, "chat/completions"),
            model: settings.model.clone(),
            api_key: api_key(settings.api_key_env.as_deref()),
            max_tokens: settings.max_tokens,
        })
    }
}

impl TextGenerator for OpenAiGenerator {
    fn complete(&self, prompt: &str) -> Result<String> {
        let generation = |e: reqwest::Error| EmbedStoreError::Generation(e.to_string());

        let mut request = self.client.post(&self.url).json(&ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().map_err(generation)?;
        if !response.status().is_success() {
            return Err(EmbedStoreError::Generation(error_body(response)));
        }
        let parsed: ChatResponse = response.json().map_err(generation)?;
        parsed.into_text()
    }

    fn model(&self) -> &str {
        &self.model
    }
}
