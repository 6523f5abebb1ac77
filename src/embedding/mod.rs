//! Embedding providers for analyzer records that arrive without a vector.
//!
//! - **[`DisabledProvider`]**: every record must carry its own embedding.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings`, key from `OPENAI_API_KEY`.
//! - **[`OllamaProvider`]**: `POST {url}/api/embed` on a local Ollama.
//! - **`LocalProvider`**: fastembed, behind the `local-embeddings-fastembed`
//!   feature. Defaults to a multilingual model, since feedback arrives in
//!   more than one language.
//!
//! The [`EmbeddingProvider`] trait itself lives in the core crate; this
//! module only adds the network and inference backends.
//!
//! # Retry strategy
//!
//! HTTP 429, 5xx and connection errors are retried with exponential
//! backoff (1s, 2s, 4s, ... capped at 32s) up to `embedding.max_retries`
//! times. Other 4xx responses fail immediately.

use anyhow::{anyhow, bail, ensure, Result};
use serde::Deserialize;
use std::time::Duration;

pub use feedback_harness_core::embedding::EmbeddingProvider;

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Default model for the `local` provider.
pub const DEFAULT_LOCAL_MODEL: &str = "paraphrase-multilingual-minilm-l12-v2";

/// Embed `texts` with the configured backend, `batch_size` texts per call.
///
/// Returns one vector per input, in input order. Vectors whose length
/// differs from `provider.dims()` are rejected.
pub async fn embed_texts(
    provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());

    for batch in texts.chunks(config.batch_size.max(1)) {
        let vectors = match config.provider.as_str() {
            "openai" => embed_openai(config, batch).await?,
            "ollama" => embed_ollama(config, batch).await?,
            #[cfg(feature = "local-embeddings-fastembed")]
            "local" => embed_local_fastembed(config, batch).await?,
            #[cfg(not(feature = "local-embeddings-fastembed"))]
            "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
            "disabled" => bail!(
                "Embedding provider is disabled; every opportunity must carry an embedding"
            ),
            other => bail!("Unknown embedding provider: {}", other),
        };

        ensure!(
            vectors.len() == batch.len(),
            "{} returned {} embeddings for {} texts",
            provider.model_name(),
            vectors.len(),
            batch.len()
        );
        check_dims(provider, &vectors)?;
        out.extend(vectors);
    }

    Ok(out)
}

fn check_dims(provider: &dyn EmbeddingProvider, vectors: &[Vec<f32>]) -> Result<()> {
    let expected = provider.dims();
    if expected == 0 {
        return Ok(());
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        bail!(
            "{} returned a {}-dimensional vector, expected {}",
            provider.model_name(),
            bad.len(),
            expected
        );
    }
    Ok(())
}

/// Send the request built by `build`, retrying transient failures.
async fn send_with_backoff(
    config: &EmbeddingConfig,
    label: &str,
    build: impl Fn() -> reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(attempt, ?delay, "{} embedding retry", label);
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(%status, "{} embedding request failed, will retry", label);
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body));
                    continue;
                }
                bail!("{} API error {}: {}", label, status, body);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} connection error: {}", label, e));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

// ============ Disabled Provider ============

/// Provider used when `embedding.provider = "disabled"`.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ OpenAI Provider ============

pub struct OpenAIProvider {
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    /// Fails if `model` or `dims` is unset, or `OPENAI_API_KEY` is missing.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

async fn embed_openai(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| anyhow!("OPENAI_API_KEY not set"))?;
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow!("embedding.model required"))?;

    let client = http_client(config)?;
    let body = serde_json::json!({ "model": model, "input": texts });

    let response = send_with_backoff(config, "OpenAI", || {
        client.post(OPENAI_URL).bearer_auth(&api_key).json(&body)
    })
    .await?;

    parse_openai_response(&response.text().await?)
}

/// Decode `data[].embedding`, restoring input order from `data[].index`.
fn parse_openai_response(body: &str) -> Result<Vec<Vec<f32>>> {
    let mut parsed: OpenAIResponse = serde_json::from_str(body)
        .map_err(|e| anyhow!("Invalid OpenAI response: {}", e))?;
    parsed.data.sort_by_key(|d| d.index);
    Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
}

// ============ Ollama Provider ============

pub struct OllamaProvider {
    model: String,
    dims: usize,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

async fn embed_ollama(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow!("embedding.model required"))?;
    let url = format!(
        "{}/api/embed",
        config
            .url
            .as_deref()
            .unwrap_or(OLLAMA_DEFAULT_URL)
            .trim_end_matches('/')
    );

    let client = http_client(config)?;
    let body = serde_json::json!({ "model": model, "input": texts });

    let response = send_with_backoff(config, "Ollama", || client.post(&url).json(&body)).await?;
    parse_ollama_response(&response.text().await?)
}

fn parse_ollama_response(body: &str) -> Result<Vec<Vec<f32>>> {
    let parsed: OllamaResponse = serde_json::from_str(body)
        .map_err(|e| anyhow!("Invalid Ollama response: {}", e))?;
    Ok(parsed.embeddings)
}

// ============ Local Provider (fastembed) ============

/// Offline inference via fastembed. The model is downloaded from Hugging
/// Face on first use and cached.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = local_model_name(config);
        config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "paraphrase-multilingual-mpnet-base-v2" | "multilingual-e5-base" => 768,
            "multilingual-e5-large" => 1024,
            _ => 384,
        });
        Ok(Self { model_name, dims })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// Configured local model, or [`DEFAULT_LOCAL_MODEL`].
pub fn local_model_name(config: &EmbeddingConfig) -> String {
    config
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string())
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel as M;
    match name {
        "paraphrase-multilingual-minilm-l12-v2" => Ok(M::ParaphraseMLMiniLML12V2),
        "paraphrase-multilingual-mpnet-base-v2" => Ok(M::ParaphraseMLMpnetBaseV2),
        "multilingual-e5-small" => Ok(M::MultilingualE5Small),
        "multilingual-e5-base" => Ok(M::MultilingualE5Base),
        "multilingual-e5-large" => Ok(M::MultilingualE5Large),
        "all-minilm-l6-v2" => Ok(M::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(M::BGESmallENV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             paraphrase-multilingual-minilm-l12-v2, paraphrase-multilingual-mpnet-base-v2, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large, \
             all-minilm-l6-v2, bge-small-en-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn embed_local_fastembed(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let fastembed_model = config_to_fastembed_model(&local_model_name(config))?;
    let batch_size = config.batch_size;
    let texts = texts.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;

        model
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow!("Local embedding failed: {}", e))
    })
    .await?
}

/// Instantiate the provider named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
