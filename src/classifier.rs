//! Remote risk scoring.
//!
//! [`HttpClassifier`] makes exactly one POST per call with no retry. Callers
//! hold an [`InFlightGuard`] for the identity while the call is outstanding;
//! the guard releases the identity when dropped, whatever the outcome.

use crate::config_loader::ClassifierConfig;
use crate::decision::{valid_unit, Assessment, Identity};
use crate::errors::{SafeLock, VeilError, VeilResult};
use crate::scanner::Item;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Wire body of a classification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub url: String,
    pub caption: String,
    pub alt_text: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub max_images: u32,
}

impl ClassificationRequest {
    pub fn from_item(
        item: &Item,
        metadata: &serde_json::Map<String, serde_json::Value>,
        max_images: u32,
    ) -> Self {
        Self {
            url: item.identity.as_str().to_string(),
            caption: item.caption.clone().unwrap_or_default(),
            alt_text: item.alt_text.clone().unwrap_or_default(),
            metadata: metadata.clone(),
            max_images,
        }
    }

    pub fn identity(&self) -> VeilResult<Identity> {
        Identity::new(&self.url).ok_or_else(|| VeilError::validation("url", "blank resource locator"))
    }
}

/// Wire body of a classification response. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationResponse {
    pub ai_generated_risk_score: Option<f64>,
    pub misinformation_risk_score: Option<f64>,
    #[serde(default)]
    pub verdict: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl ClassificationResponse {
    pub fn into_assessment(self, identity: Identity) -> VeilResult<Assessment> {
        let ai = score("ai_generated_risk_score", self.ai_generated_risk_score)?;
        let misinfo = score("misinformation_risk_score", self.misinformation_risk_score)?;
        Ok(Assessment::remote(identity, ai, misinfo))
    }
}

fn score(field: &str, value: Option<f64>) -> VeilResult<f64> {
    match value {
        Some(v) if valid_unit(v) => Ok(v),
        Some(v) => Err(VeilError::malformed(format!("{field} out of range: {v}"))),
        None => Err(VeilError::malformed(format!("{field} missing"))),
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Score one item. Exactly one remote call, no retry.
    async fn classify(&self, request: ClassificationRequest) -> VeilResult<Assessment>;

    fn name(&self) -> &str;
}

pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> VeilResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("feedveil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VeilError::network("building http client", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn from_config(config: &ClassifierConfig) -> VeilResult<Self> {
        Self::new(config.endpoint.clone(), Duration::from_millis(config.timeout_ms))
    }

    async fn round_trip(&self, request: &ClassificationRequest) -> VeilResult<ClassificationResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| VeilError::network("classification request", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VeilError::rejected(status.as_u16(), body));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| VeilError::network("reading classification body", e))?;
        serde_json::from_slice(&body).map_err(|e| VeilError::malformed(e.to_string()))
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, request: ClassificationRequest) -> VeilResult<Assessment> {
        let identity = request.identity()?;
        let response = match tokio::time::timeout(self.timeout, self.round_trip(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(identity = %identity.fingerprint(), "classification timed out");
                return Err(VeilError::timeout("classification", self.timeout.as_millis() as u64));
            }
        };
        debug!(
            identity = %identity.fingerprint(),
            verdict = ?response.verdict,
            confidence = ?response.confidence,
            "classification response"
        );
        response.into_assessment(identity)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Identities with an outstanding classification request.
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    inner: Arc<Mutex<HashSet<Identity>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-add in one step. `None` if the identity is already in flight.
    pub fn try_acquire(&self, identity: &Identity) -> VeilResult<Option<InFlightGuard>> {
        let mut set = self.inner.safe_lock()?;
        if !set.insert(identity.clone()) {
            return Ok(None);
        }
        Ok(Some(InFlightGuard {
            set: Arc::clone(&self.inner),
            identity: identity.clone(),
        }))
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.inner
            .safe_lock()
            .map(|set| set.contains(identity))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.safe_lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Membership of one identity in an [`InFlightSet`], released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    set: Arc<Mutex<HashSet<Identity>>>,
    identity: Identity,
}

impl InFlightGuard {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = match self.set.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.identity);
    }
}
