//! Embedding models: the offline hashing model and a remote
//! OpenAI-compatible embeddings endpoint.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use patternlink_shared::{EmbeddingConfig, PatternLinkError, Result};

/// Default dimension of the hashing model.
pub const DEFAULT_HASHING_DIM: usize = 384;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A text embedding model.
pub trait Embedder: Send + Sync {
    /// Stable identifier, e.g. `hashing-384` or `remote:<model>`.
    fn model_id(&self) -> &str;

    /// Vector dimension, if known before the first call.
    fn dimension(&self) -> Option<usize>;

    /// Embed every text, preserving order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Build the embedder named by `config.model_id`.
///
/// `hashing-<dim>` (or bare `hashing`) selects [`HashingEmbedder`];
/// `remote:<model>` selects [`RemoteEmbedder`] against `config.base_url`.
pub fn embedder_from_config(
    config: &EmbeddingConfig,
    api_key: Option<String>,
) -> Result<Box<dyn Embedder>> {
    let id = config.model_id.trim();
    if id == "hashing" {
        return Ok(Box::new(HashingEmbedder::new(DEFAULT_HASHING_DIM)?));
    }
    if let Some(dim) = id.strip_prefix("hashing-") {
        let dim: usize = dim.parse().map_err(|_| {
            PatternLinkError::Embedding(format!("invalid hashing dimension in '{id}'"))
        })?;
        return Ok(Box::new(HashingEmbedder::new(dim)?));
    }
    if let Some(model) = id.strip_prefix("remote:") {
        return Ok(Box::new(RemoteEmbedder::new(
            &config.base_url,
            model,
            api_key,
            config.timeout_secs,
        )?));
    }
    Err(PatternLinkError::Embedding(format!(
        "unknown embedding model '{id}' (expected hashing-<dim> or remote:<model>)"
    )))
}

// ---------------------------------------------------------------------------
// Hashing model
// ---------------------------------------------------------------------------

/// Deterministic feature-hashing embedder.
///
/// Word unigrams, word bigrams and character trigrams are hashed with
/// SHA-256 into signed buckets; the result is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(PatternLinkError::Embedding(
                "hashing dimension must be positive".into(),
            ));
        }
        Ok(Self {
            dim,
            model_id: format!("hashing-{dim}"),
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        for token in &tokens {
            self.add(&mut vector, &format!("w:{token}"), 1.0);
        }
        for pair in tokens.windows(2) {
            self.add(&mut vector, &format!("b:{} {}", pair[0], pair[1]), 1.0);
        }
        for token in &tokens {
            let padded: Vec<char> = format!("^{token}$").chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add(&mut vector, &format!("c:{gram}"), 0.5);
            }
        }

        l2_normalize(&mut vector);
        vector
    }

    fn add(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(raw) % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dim)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Scale to unit length; zero vectors stay zero.
pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// Remote model
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Blocking client for `POST {base_url}/embeddings`.
pub struct RemoteEmbedder {
    base_url: String,
    model: String,
    model_id: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
    dimension: OnceLock<usize>,
}

impl RemoteEmbedder {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PatternLinkError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            model_id: format!("remote:{model}"),
            api_key,
            client,
            timeout_secs,
            dimension: OnceLock::new(),
        })
    }
}

impl Embedder for RemoteEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    #[instrument(skip_all, fields(model = %self.model, count = texts.len()))]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let mut request = self.client.post(&url).json(&EmbeddingsRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                PatternLinkError::Network(format!(
                    "embedding request timed out after {}s",
                    self.timeout_secs
                ))
            } else {
                PatternLinkError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(PatternLinkError::Network(format!(
                "embeddings endpoint returned {}: {body}",
                status.as_u16()
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .map_err(|e| PatternLinkError::Embedding(format!("invalid embeddings response: {e}")))?;
        if parsed.data.len() != texts.len() {
            return Err(PatternLinkError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        let vectors: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();

        let dim = vectors.first().map_or(0, Vec::len);
        if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
            return Err(PatternLinkError::Embedding(
                "embeddings have inconsistent dimensions".into(),
            ));
        }
        let known = *self.dimension.get_or_init(|| dim);
        if known != dim {
            return Err(PatternLinkError::Embedding(format!(
                "embedding dimension changed from {known} to {dim}"
            )));
        }
        debug!(dim, "received embeddings");
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64).unwrap();
        let a = e.embed_batch(&texts(&["The quiet door"])).unwrap();
        let b = e.embed_batch(&texts(&["The quiet door"])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
        assert!((norm(&a[0]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(8).unwrap();
        let v = e.embed_batch(&texts(&["  ...  "])).unwrap();
        assert!(v[0].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn hashing_rejects_zero_dimension() {
        assert!(HashingEmbedder::new(0).is_err());
    }

    #[test]
    fn factory_selects_by_model_id() {
        let mut config = EmbeddingConfig::default();
        let e = embedder_from_config(&config, None).unwrap();
        assert_eq!(e.model_id(), "hashing-384");
        assert_eq!(e.dimension(), Some(384));

        config.model_id = "hashing-32".into();
        assert_eq!(embedder_from_config(&config, None).unwrap().dimension(), Some(32));

        config.model_id = "word2vec".into();
        assert!(embedder_from_config(&config, None).is_err());

        config.model_id = "hashing-abc".into();
        assert!(embedder_from_config(&config, None).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_embedder_posts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .mount(&server)
            .await;

        let uri = server.uri();
        let (vectors, dim, id) = tokio::task::spawn_blocking(move || {
            let e = RemoteEmbedder::new(&uri, "embed-small", Some("test-key".into()), 5).unwrap();
            let vectors = e.embed_batch(&texts(&["a", "b"])).unwrap();
            (vectors, e.dimension(), e.model_id().to_string())
        })
        .await
        .unwrap();

        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(dim, Some(2));
        assert_eq!(id, "remote:embed-small");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_embedder_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let uri = server.uri();
        let result = tokio::task::spawn_blocking(move || {
            let e = RemoteEmbedder::new(&uri, "m", None, 5).unwrap();
            e.embed_batch(&texts(&["a"]))
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(PatternLinkError::Network(msg)) if msg.contains("401")));
    }
}
