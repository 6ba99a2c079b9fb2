//! Signing wormhole session
//!
//! A [`Session`] binds one [`Keypair`] to one open [`Channel`]. While bound it
//! is subscribed to `agent/<identity>/sign` and answers every pushed
//! `{entry, id}` with a `holo/clientSignature` call carrying the signature.
//! The private key never leaves the process.
//!
//! Rebinding (new keypair or new channel) tears down the previous
//! subscription before subscribing the new one. The binding lock is held for
//! the whole switch, so calls waiting on the keypair see the new one only once
//! its subscription is in place.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::keypair::{AgentIdentity, Keypair};
use crate::types::{Result, WormholeError};

pub use memory::{InMemoryChannel, RecordedCall};

/// Host method announcing the bound agent
pub const IDENTIFY_METHOD: &str = "holo/identify";

/// Host method registering the agent with a hApp
pub const AGENTS_NEW_METHOD: &str = "holo/agents/new";

/// Host method receiving signatures for pushed sign requests
pub const CLIENT_SIGNATURE_METHOD: &str = "holo/clientSignature";

// ============================================================================
// Channel Trait (for dependency injection)
// ============================================================================

/// Bidirectional request/response + push channel to a host
#[async_trait]
pub trait Channel: Send + Sync {
    /// Issue a request and wait for its response
    async fn call(&self, method: &str, params: Value) -> Result<Value>;

    /// Ask the host to start pushing `event`
    async fn subscribe(&self, event: &str) -> Result<()>;

    /// Ask the host to stop pushing `event`
    async fn unsubscribe(&self, event: &str) -> Result<()>;

    /// Receive payloads pushed on `event`
    fn on(&self, event: &str) -> mpsc::UnboundedReceiver<Value>;

    fn is_open(&self) -> bool;
}

/// Payload pushed on the sign event
#[derive(Debug, Deserialize)]
struct SignRequest {
    entry: String,
    id: String,
}

struct Binding {
    keypair: Arc<Keypair>,
    channel: Arc<dyn Channel>,
    event: String,
    dispatch: JoinHandle<()>,
}

/// Owns the bound keypair and the open channel
pub struct Session {
    config: SessionConfig,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    binding: RwLock<Option<Binding>>,
}

impl Session {
    /// Create a session with no channel and no keypair
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            channel: RwLock::new(None),
            binding: RwLock::new(None),
        }
    }

    /// Create a session over an already open channel
    pub fn with_channel(config: SessionConfig, channel: Arc<dyn Channel>) -> Self {
        Self {
            config,
            channel: RwLock::new(Some(channel)),
            binding: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The current channel, if one is attached
    pub async fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.read().await.clone()
    }

    /// The bound keypair. Waits for any rebinding in progress.
    pub async fn keypair(&self) -> Option<Arc<Keypair>> {
        self.binding.read().await.as_ref().map(|b| b.keypair.clone())
    }

    pub async fn identity(&self) -> Option<AgentIdentity> {
        self.binding
            .read()
            .await
            .as_ref()
            .map(|b| b.keypair.identity().clone())
    }

    /// Event name the session is currently subscribed to
    pub async fn subscribed_event(&self) -> Option<String> {
        self.binding.read().await.as_ref().map(|b| b.event.clone())
    }

    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        match self.channel().await {
            Some(channel) if channel.is_open() => Ok(channel),
            _ => Err(WormholeError::NoChannel),
        }
    }

    /// Bind `keypair` to the open channel.
    ///
    /// Announces the identity, subscribes to its sign event and starts
    /// answering sign requests. `identify` and `subscribe` failures are
    /// logged and not retried.
    pub async fn bind(&self, keypair: Keypair) -> Result<()> {
        let mut binding = self.binding.write().await;
        let channel = self.open_channel().await?;
        teardown(binding.take()).await;
        *binding = Some(establish(channel, Arc::new(keypair)).await);
        Ok(())
    }

    /// Drop the bound keypair and its subscription.
    pub async fn unbind(&self) {
        let mut binding = self.binding.write().await;
        teardown(binding.take()).await;
    }

    /// Replace the channel, e.g. after a reconnect. A bound keypair is
    /// rebound on the new channel before this returns.
    ///
    /// If `channel` is not open the current binding is kept and
    /// [`WormholeError::NoChannel`] is returned; attaching an open channel
    /// later rebinds the same keypair.
    pub async fn attach_channel(&self, channel: Arc<dyn Channel>) -> Result<()> {
        // Lock order: binding, then channel (same as `bind`)
        let mut binding = self.binding.write().await;
        *self.channel.write().await = Some(channel.clone());

        let Some(current) = binding.as_ref() else {
            return Ok(());
        };
        if !channel.is_open() {
            warn!(identity = %current.keypair.identity(), "Attached channel is closed, keeping current binding");
            return Err(WormholeError::NoChannel);
        }

        let keypair = current.keypair.clone();
        teardown(binding.take()).await;
        *binding = Some(establish(channel, keypair).await);
        Ok(())
    }

    /// Register the bound agent with the configured hApp.
    pub async fn register_agent(&self) -> Result<Value> {
        let identity = self.identity().await.ok_or(WormholeError::NoKeys)?;
        let channel = self.open_channel().await?;

        let response = channel
            .call(
                AGENTS_NEW_METHOD,
                json!({ "agentId": identity.as_str(), "happId": self.config.happ_id }),
            )
            .await?;
        info!(identity = %identity, happ_id = %self.config.happ_id, "Registered agent");
        Ok(response)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.dispatch.abort();
        }
    }
}

async fn establish(channel: Arc<dyn Channel>, keypair: Arc<Keypair>) -> Binding {
    let identity = keypair.identity().clone();

    if let Err(e) = channel
        .call(IDENTIFY_METHOD, json!({ "agentId": identity.as_str() }))
        .await
    {
        error!(identity = %identity, error = %e, "Identify call failed");
    }

    let event = identity.sign_event();
    let events = channel.on(&event);
    if let Err(e) = channel.subscribe(&event).await {
        error!(event = %event, error = %e, "Subscribe failed");
    }

    let dispatch = tokio::spawn(dispatch_sign_requests(
        events,
        keypair.clone(),
        channel.clone(),
    ));

    info!(identity = %identity, "Bound keypair to channel");
    Binding {
        keypair,
        channel,
        event,
        dispatch,
    }
}

async fn teardown(binding: Option<Binding>) {
    let Some(binding) = binding else {
        return;
    };
    binding.dispatch.abort();
    if let Err(e) = binding.channel.unsubscribe(&binding.event).await {
        warn!(event = %binding.event, error = %e, "Unsubscribe failed");
    }
    debug!(identity = %binding.keypair.identity(), "Unbound keypair");
}

/// Receive sign requests and answer each on its own task.
async fn dispatch_sign_requests(
    mut events: mpsc::UnboundedReceiver<Value>,
    keypair: Arc<Keypair>,
    channel: Arc<dyn Channel>,
) {
    while let Some(payload) = events.recv().await {
        let keypair = keypair.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = answer_sign_request(&keypair, channel.as_ref(), payload).await {
                warn!(identity = %keypair.identity(), error = %e, "Dropped sign request");
            }
        });
    }
    debug!(identity = %keypair.identity(), "Sign request stream closed");
}

async fn answer_sign_request(keypair: &Keypair, channel: &dyn Channel, payload: Value) -> Result<()> {
    let request: SignRequest = serde_json::from_value(payload)?;
    let signature = keypair.sign(request.entry.as_bytes())?;

    channel
        .call(
            CLIENT_SIGNATURE_METHOD,
            json!({ "signature": BASE64.encode(signature), "requestId": request.id }),
        )
        .await?;

    debug!(request_id = %request.id, "Answered sign request");
    Ok(())
}
