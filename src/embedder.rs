//! Embedding client: HTTP/JSON against a local model runner.
//!
//! Batches up to 64 texts per call, retries with exponential backoff, and
//! trips a circuit breaker after sustained failure so ingestion pipelines
//! fail fast instead of hammering a dead backend.

use serde_json::json;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::EmbedderSettings;
use crate::error::{CoreError, CoreResult};

/// Max texts per embedding call.
pub const EMBED_BATCH: usize = 64;

/// Candidates handed to the reranker.
pub const RERANK_WINDOW: usize = 50;

const BACKOFF_MS: [u64; 4] = [100, 200, 400, 800];

/// Consecutive failures within the window that open the breaker.
const BREAKER_THRESHOLD: u32 = 10;
const BREAKER_WINDOW: Duration = Duration::from_secs(30);
const BREAKER_OPEN: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Interface the pipelines program against. The production implementation
/// speaks HTTP; tests substitute a deterministic local embedder.
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts. Every returned vector has the same length.
    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>>;

    /// Cross-encoder scores for (query, candidate) pairs, higher is better.
    fn rerank(&self, query: &str, candidates: &[String]) -> CoreResult<Vec<f32>>;

    /// Cheap readiness probe for /health.
    fn ready(&self) -> bool;

    fn embed_one(&self, text: &str) -> CoreResult<Vec<f32>> {
        let mut out = self.embed(std::slice::from_ref(&text.to_string()))?;
        out.pop()
            .ok_or_else(|| CoreError::dependency("embedding backend returned no vector"))
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

struct Breaker {
    consecutive: u32,
    window_start: Option<Instant>,
    open_until: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Breaker {
            consecutive: 0,
            window_start: None,
            open_until: None,
        }
    }

    fn check(&mut self) -> CoreResult<()> {
        if let Some(until) = self.open_until {
            if Instant::now() < until {
                return Err(CoreError::dependency(
                    "embedding backend unavailable (circuit open)",
                ));
            }
            // Half-open: allow the next attempt through.
            self.open_until = None;
            self.consecutive = 0;
            self.window_start = None;
        }
        Ok(())
    }

    fn record_success(&mut self) {
        self.consecutive = 0;
        self.window_start = None;
    }

    fn record_failure(&mut self) {
        let now = Instant::now();
        match self.window_start {
            Some(start) if now.duration_since(start) <= BREAKER_WINDOW => {
                self.consecutive += 1;
            }
            _ => {
                self.window_start = Some(now);
                self.consecutive = 1;
            }
        }
        if self.consecutive >= BREAKER_THRESHOLD {
            warn!("Embedding circuit breaker opened");
            self.open_until = Some(now + BREAKER_OPEN);
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Synchronous HTTP client for an OpenAI-compatible local model runner.
/// Safe to call from blocking worker threads.
pub struct HttpEmbedder {
    agent: ureq::Agent,
    settings: EmbedderSettings,
    breaker: Mutex<Breaker>,
}

impl HttpEmbedder {
    pub fn new(settings: EmbedderSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.attempt_timeout_secs))
            .build();
        HttpEmbedder {
            agent,
            settings,
            breaker: Mutex::new(Breaker::new()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.settings.url.trim_end_matches('/'))
    }

    /// One batch with retries inside the per-batch budget.
    fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        self.breaker.lock().unwrap().check()?;

        let deadline = Instant::now() + Duration::from_secs(self.settings.batch_budget_secs);
        let payload = json!({
            "model": self.settings.model,
            "input": texts,
        });

        let mut last_err = String::new();
        for (attempt, backoff) in BACKOFF_MS.iter().enumerate() {
            if Instant::now() >= deadline {
                break;
            }
            match self
                .agent
                .post(&self.endpoint("/v1/embeddings"))
                .send_json(payload.clone())
            {
                Ok(response) => {
                    let body: serde_json::Value = response.into_json().map_err(|e| {
                        CoreError::dependency(format!("embedding response unreadable: {e}"))
                    })?;
                    let vectors = parse_embedding_response(&body)?;
                    if vectors.len() != texts.len() {
                        return Err(CoreError::dependency(format!(
                            "embedding backend returned {} vectors for {} inputs",
                            vectors.len(),
                            texts.len()
                        )));
                    }
                    self.breaker.lock().unwrap().record_success();
                    return Ok(vectors);
                }
                Err(ureq::Error::Status(code, _)) if (400..500).contains(&code) => {
                    // Client errors are not retried.
                    self.breaker.lock().unwrap().record_failure();
                    return Err(CoreError::dependency(format!(
                        "embedding backend rejected request: HTTP {code}"
                    )));
                }
                Err(e) => {
                    last_err = e.to_string();
                    debug!(attempt = attempt + 1, error = %last_err, "Embedding attempt failed");
                    self.breaker.lock().unwrap().record_failure();
                    std::thread::sleep(Duration::from_millis(*backoff));
                }
            }
        }
        Err(CoreError::dependency(format!(
            "embedding backend unreachable after retries: {last_err}"
        )))
    }
}

fn parse_embedding_response(body: &serde_json::Value) -> CoreResult<Vec<Vec<f32>>> {
    body.get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| CoreError::dependency("embedding response missing data array"))?
        .iter()
        .map(|item| {
            item.get("embedding")
                .and_then(|e| e.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect::<Vec<f32>>()
                })
                .ok_or_else(|| CoreError::dependency("embedding response item malformed"))
        })
        .collect()
}

impl EmbeddingClient for HttpEmbedder {
    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH) {
            out.extend(self.embed_batch(batch)?);
        }
        Ok(out)
    }

    fn rerank(&self, query: &str, candidates: &[String]) -> CoreResult<Vec<f32>> {
        if self.settings.rerank_model.is_empty() {
            return Err(CoreError::dependency("no rerank model configured"));
        }
        self.breaker.lock().unwrap().check()?;
        let payload = json!({
            "model": self.settings.rerank_model,
            "query": query,
            "documents": candidates,
        });
        let response = self
            .agent
            .post(&self.endpoint("/v1/rerank"))
            .send_json(payload)
            .map_err(|e| {
                self.breaker.lock().unwrap().record_failure();
                CoreError::dependency(format!("rerank call failed: {e}"))
            })?;
        let body: serde_json::Value = response
            .into_json()
            .map_err(|e| CoreError::dependency(format!("rerank response unreadable: {e}")))?;

        let mut scores = vec![0.0f32; candidates.len()];
        let results = body
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| CoreError::dependency("rerank response missing results"))?;
        for item in results {
            let idx = item.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
            let score = item
                .get("relevance_score")
                .and_then(|s| s.as_f64())
                .unwrap_or(0.0) as f32;
            if idx < scores.len() {
                scores[idx] = score;
            }
        }
        self.breaker.lock().unwrap().record_success();
        Ok(scores)
    }

    fn ready(&self) -> bool {
        self.agent
            .get(&self.endpoint("/v1/models"))
            .call()
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Deterministic embedder (tests, offline smoke runs)
// ---------------------------------------------------------------------------

/// Hash-derived unit vectors: deterministic, dimension-stable, no network.
/// Texts sharing terms land near each other, which is all the retrieval
/// tests need.
pub struct HashEmbedder {
    pub dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        HashEmbedder { dimension }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];
        for term in crate::retrieval::tokenize_terms(text) {
            let mut h: u64 = 0xcbf29ce484222325;
            for b in term.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            vec[(h % self.dimension as u64) as usize] += 1.0;
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

impl EmbeddingClient for HashEmbedder {
    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn rerank(&self, query: &str, candidates: &[String]) -> CoreResult<Vec<f32>> {
        let q = self.embed_text(query);
        Ok(candidates
            .iter()
            .map(|c| {
                let v = self.embed_text(c);
                q.iter().zip(v.iter()).map(|(a, b)| a * b).sum()
            })
            .collect())
    }

    fn ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embedding_response() {
        let body = json!({
            "data": [
                { "embedding": [0.1, 0.2] },
                { "embedding": [0.3, 0.4] }
            ]
        });
        let vectors = parse_embedding_response(&body).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![0.3f32, 0.4]);
    }

    #[test]
    fn test_parse_malformed_response_is_dependency() {
        let err = parse_embedding_response(&json!({"oops": true})).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut breaker = Breaker::new();
        for _ in 0..BREAKER_THRESHOLD {
            breaker.record_failure();
        }
        assert!(breaker.check().is_err());
    }

    #[test]
    fn test_breaker_resets_on_success() {
        let mut breaker = Breaker::new();
        for _ in 0..BREAKER_THRESHOLD - 1 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..BREAKER_THRESHOLD - 1 {
            breaker.record_failure();
        }
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed_one("user authenticate session").unwrap();
        let b = embedder.embed_one("user authenticate session").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_similar_texts_score_higher() {
        let embedder = HashEmbedder::new(128);
        let q = embedder.embed_one("authenticate user login").unwrap();
        let close = embedder.embed_one("def authenticate user").unwrap();
        let far = embedder.embed_one("completely unrelated walrus content").unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&q, &close) > dot(&q, &far));
    }

    #[test]
    fn test_unreachable_backend_is_transient_error() {
        // Port 1 refuses connections immediately.
        let settings = EmbedderSettings {
            url: "http://127.0.0.1:1".to_string(),
            attempt_timeout_secs: 1,
            batch_budget_secs: 1,
            ..Default::default()
        };
        let embedder = HttpEmbedder::new(settings);
        let err = embedder.embed(&["hello".to_string()]).unwrap_err();
        assert!(err.is_transient());
        assert!(!embedder.ready());
    }
}
