//! Remote entropy and salt registry client
//!
//! The service hands out 32 bytes of entropy over a plain channel and keeps a
//! per-email salt so a readwrite identity can be regenerated later.
//!
//! Endpoints:
//! - `GET  /v1/entropy`          → `{ "entropy": "<base64>" }`
//! - `POST /v1/salt`             ← `{ "email", "salt": "<base64>" }`
//! - `GET  /v1/salt?email=<..>`  → `{ "salt": "<base64>" }` or 404

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::{Entropy, EntropySource};
use crate::types::{Result, WormholeError};

/// Default timeout for salt service requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct EntropyResponse {
    entropy: String,
}

#[derive(Debug, Serialize)]
struct RegisterSaltRequest<'a> {
    email: &'a str,
    salt: String,
}

#[derive(Debug, Deserialize)]
struct SaltResponse {
    salt: String,
}

/// Error response from the service
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Salt Registry Trait (for dependency injection)
// ============================================================================

/// Per-email salt storage
#[async_trait]
pub trait SaltRegistry: Send + Sync {
    /// Record `salt` under `email`
    async fn register_salt(&self, email: &str, salt: &Entropy) -> Result<()>;

    /// Look up the salt registered under `email`, `None` if there is none
    async fn registered_salt(&self, email: &str) -> Result<Option<Entropy>>;
}

// ============================================================================
// HTTP client
// ============================================================================

/// HTTP client for the entropy / salt service
pub struct SaltServiceClient {
    base_url: String,
    http: reqwest::Client,
}

impl SaltServiceClient {
    /// Create a new client for the given base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WormholeError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch 32 bytes of remotely issued entropy.
    pub async fn remote_entropy(&self) -> Result<Entropy> {
        let url = format!("{}/v1/entropy", self.base_url);
        let response = self.http.get(&url).send().await?;
        let response = check_status(response, "Entropy request").await?;

        let body: EntropyResponse = response.json().await?;
        let bytes = decode_base64(&body.entropy, "entropy")?;
        debug!("Received remote entropy");
        Entropy::from_slice(&bytes)
    }
}

#[async_trait]
impl EntropySource for SaltServiceClient {
    async fn entropy(&self) -> Result<Entropy> {
        self.remote_entropy().await
    }
}

#[async_trait]
impl SaltRegistry for SaltServiceClient {
    async fn register_salt(&self, email: &str, salt: &Entropy) -> Result<()> {
        let url = format!("{}/v1/salt", self.base_url);
        let body = RegisterSaltRequest {
            email,
            salt: BASE64.encode(salt.as_bytes()),
        };

        let response = self.http.post(&url).json(&body).send().await?;
        check_status(response, "Salt registration").await?;
        Ok(())
    }

    async fn registered_salt(&self, email: &str) -> Result<Option<Entropy>> {
        let url = format!("{}/v1/salt", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("email", email)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, "Salt lookup").await?;

        let body: SaltResponse = response.json().await?;
        let bytes = decode_base64(&body.salt, "salt")?;
        Entropy::from_slice(&bytes).map(Some)
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    if let Ok(err) = serde_json::from_str::<ErrorResponse>(&body) {
        return Err(WormholeError::SaltService(format!(
            "{what} failed ({status}): {}",
            err.error
        )));
    }
    Err(WormholeError::SaltService(format!(
        "{what} failed ({status}): {body}"
    )))
}

fn decode_base64(value: &str, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| WormholeError::SaltService(format!("Invalid {field} encoding: {e}")))
}

// ============================================================================
// In-memory registry
// ============================================================================

/// Salt registry kept in process memory
#[derive(Default)]
pub struct InMemorySaltRegistry {
    salts: RwLock<HashMap<String, Entropy>>,
}

impl InMemorySaltRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.salts.read().await.len()
    }
}

#[async_trait]
impl SaltRegistry for InMemorySaltRegistry {
    async fn register_salt(&self, email: &str, salt: &Entropy) -> Result<()> {
        self.salts
            .write()
            .await
            .insert(email.to_string(), salt.clone());
        Ok(())
    }

    async fn registered_salt(&self, email: &str) -> Result<Option<Entropy>> {
        Ok(self.salts.read().await.get(email).cloned())
    }
}
