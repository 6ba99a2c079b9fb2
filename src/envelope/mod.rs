//! Signed call envelopes
//!
//! Every application call `instanceId/zome/function` is signed and wrapped in
//! a [`CallEnvelope`], then sent through the host's single multiplexing method
//! (`holo/call` by default) instead of under its own name.
//!
//! The signature covers the canonical JSON of `{"method", "params"}` with keys
//! sorted at every level, not the envelope.
//!
//! Responses of the form `{"Err": {"code": 401}}` raise an
//! [`AuthEvent::AuthorizationRequired`] on the signer's event channel. The
//! response itself is returned unchanged; retrying is up to the caller.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::Session;
use crate::types::{Result, WormholeError};

/// Host error code meaning the agent must re-authenticate
pub const AUTHORIZATION_REQUIRED_CODE: u16 = 401;

/// Authenticated wrapper around one application call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    pub agent_id: String,
    pub happ_id: String,
    pub instance_id: String,
    pub zome: String,
    pub function: String,
    pub args: Value,
    /// Base64 Ed25519 signature over the canonical `{method, params}`
    pub signature: String,
}

/// Envelope plus the host method it must be sent through
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub method: String,
    pub envelope: CallEnvelope,
}

impl PreparedCall {
    pub fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.envelope)?)
    }
}

/// Signals raised by [`CallSigner`] for the application to act on
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthEvent {
    /// The host rejected a call with 401; re-derive or re-prompt, then rebind
    AuthorizationRequired,
}

/// Split `instanceId/zome/function`.
pub fn parse_method(method: &str) -> Result<(&str, &str, &str)> {
    let mut parts = method.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(instance), Some(zome), Some(function), None)
            if !instance.is_empty() && !zome.is_empty() && !function.is_empty() =>
        {
            Ok((instance, zome, function))
        }
        _ => Err(WormholeError::InvalidMethod(format!(
            "expected 'instanceId/zome/function', got '{method}'"
        ))),
    }
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Deterministic string signed for a call.
pub fn canonical_call(method: &str, params: &Value) -> Result<String> {
    let mut call = Map::new();
    call.insert("method".to_string(), Value::String(method.to_string()));
    call.insert("params".to_string(), params.clone());
    Ok(serde_json::to_string(&sorted(&Value::Object(call)))?)
}

/// Whether a host response is the authorization-required error.
pub fn is_authorization_error(response: &Value) -> bool {
    match response.get("Err").and_then(|e| e.get("code")) {
        Some(Value::Number(n)) => n.as_u64() == Some(u64::from(AUTHORIZATION_REQUIRED_CODE)),
        Some(Value::String(s)) => s.trim() == AUTHORIZATION_REQUIRED_CODE.to_string(),
        _ => false,
    }
}

/// Turn an authorization-required response into an error.
pub fn ensure_authorized(response: &Value) -> Result<()> {
    if is_authorization_error(response) {
        return Err(WormholeError::AuthorizationRequired);
    }
    Ok(())
}

/// Signs outbound calls with the session's bound keypair
pub struct CallSigner {
    session: Arc<Session>,
    auth_tx: mpsc::UnboundedSender<AuthEvent>,
}

impl CallSigner {
    /// Create a signer and the receiving end of its [`AuthEvent`] channel
    pub fn new(session: Arc<Session>) -> (Self, mpsc::UnboundedReceiver<AuthEvent>) {
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        (Self { session, auth_tx }, auth_rx)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Sign `method` + `params` and build the envelope.
    ///
    /// Fails with [`WormholeError::NoKeys`] before touching the channel when
    /// no keypair is bound.
    pub async fn pre_call(&self, method: &str, params: Value) -> Result<PreparedCall> {
        let keypair = self.session.keypair().await.ok_or(WormholeError::NoKeys)?;
        let (instance_id, zome, function) = parse_method(method)?;

        let canonical = canonical_call(method, &params)?;
        let signature = keypair.sign(canonical.as_bytes())?;
        let config = self.session.config();

        debug!(identity = %keypair.identity(), method = %method, "Signed call");

        Ok(PreparedCall {
            method: config.call_method.clone(),
            envelope: CallEnvelope {
                agent_id: keypair.identity().to_string(),
                happ_id: config.happ_id.clone(),
                instance_id: instance_id.to_string(),
                zome: zome.to_string(),
                function: function.to_string(),
                args: params,
                signature: BASE64.encode(signature),
            },
        })
    }

    /// Inspect a host response, raising [`AuthEvent::AuthorizationRequired`]
    /// on a 401. Always returns `response` unchanged.
    pub fn post_call(&self, response: Value) -> Value {
        if is_authorization_error(&response) {
            warn!("Host requires re-authentication");
            if self.auth_tx.send(AuthEvent::AuthorizationRequired).is_err() {
                debug!("No listener for authorization events");
            }
        }
        response
    }

    /// `pre_call`, send through the session channel, `post_call`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let prepared = self.pre_call(method, params).await?;
        let channel = self.session.channel().await.ok_or(WormholeError::NoChannel)?;
        let response = channel.call(&prepared.method, prepared.params()?).await?;
        Ok(self.post_call(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::entropy::Entropy;
    use crate::keypair::Keypair;
    use crate::session::InMemoryChannel;
    use serde_json::json;

    fn seeded(byte: u8) -> Keypair {
        Keypair::from_seed(&Entropy::from_bytes([byte; 32])).unwrap()
    }

    async fn bound_signer(
        channel: &Arc<InMemoryChannel>,
    ) -> (CallSigner, mpsc::UnboundedReceiver<AuthEvent>, Keypair) {
        let session = Arc::new(Session::with_channel(
            SessionConfig::new("my-happ"),
            channel.clone(),
        ));
        let kp = seeded(1);
        session.bind(kp.clone()).await.unwrap();
        let (signer, rx) = CallSigner::new(session);
        (signer, rx, kp)
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(
            parse_method("inst/zome/fn").unwrap(),
            ("inst", "zome", "fn")
        );
        for bad in ["", "inst/zome", "inst//fn", "a/b/c/d", "/zome/fn", "inst/zome/"] {
            assert!(
                matches!(parse_method(bad), Err(WormholeError::InvalidMethod(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_canonical_call_sorts_keys() {
        let a = canonical_call("i/z/f", &json!({ "b": 1, "a": { "y": 2, "x": [ { "d": 0, "c": 1 } ] } }))
            .unwrap();
        assert_eq!(
            a,
            r#"{"method":"i/z/f","params":{"a":{"x":[{"c":1,"d":0}],"y":2},"b":1}}"#
        );
    }

    #[test]
    fn test_authorization_error_detection() {
        assert!(is_authorization_error(&json!({ "Err": { "code": 401 } })));
        assert!(is_authorization_error(&json!({ "Err": { "code": "401", "message": "x" } })));
        assert!(!is_authorization_error(&json!({ "Err": { "code": 500 } })));
        assert!(!is_authorization_error(&json!({ "Ok": { "code": 401 } })));
        assert!(!is_authorization_error(&json!(401)));

        assert!(matches!(
            ensure_authorized(&json!({ "Err": { "code": 401 } })),
            Err(WormholeError::AuthorizationRequired)
        ));
        assert!(ensure_authorized(&json!({ "Ok": null })).is_ok());
    }

    #[tokio::test]
    async fn test_pre_call_without_keys() {
        let channel = Arc::new(InMemoryChannel::new());
        let session = Arc::new(Session::with_channel(
            SessionConfig::new("my-happ"),
            channel.clone(),
        ));
        let (signer, _rx) = CallSigner::new(session);

        assert!(matches!(
            signer.pre_call("i/z/f", json!({})).await,
            Err(WormholeError::NoKeys)
        ));
        assert!(matches!(
            signer.call("i/z/f", json!({})).await,
            Err(WormholeError::NoKeys)
        ));
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pre_call_builds_signed_envelope() {
        let channel = Arc::new(InMemoryChannel::new());
        let (signer, _rx, kp) = bound_signer(&channel).await;
        let params = json!({ "title": "hello", "count": 2 });

        let prepared = signer.pre_call("inst-1/posts/create", params.clone()).await.unwrap();
        assert_eq!(prepared.method, "holo/call");

        let env = &prepared.envelope;
        assert_eq!(env.agent_id, kp.identity().as_str());
        assert_eq!(env.happ_id, "my-happ");
        assert_eq!(env.instance_id, "inst-1");
        assert_eq!(env.zome, "posts");
        assert_eq!(env.function, "create");
        assert_eq!(env.args, params);

        let sig = BASE64.decode(&env.signature).unwrap();
        let canonical = canonical_call("inst-1/posts/create", &params).unwrap();
        assert!(kp.verify(&sig, canonical.as_bytes()));

        let json = prepared.params().unwrap();
        for key in ["agentId", "happId", "instanceId", "zome", "function", "args", "signature"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn test_post_call_401_fires_once() {
        let channel = Arc::new(InMemoryChannel::new());
        let (signer, mut rx, _) = bound_signer(&channel).await;
        let response = json!({ "Err": { "code": 401, "message": "expired" } });

        let returned = signer.post_call(response.clone());
        assert_eq!(returned, response);
        assert_eq!(rx.try_recv().unwrap(), AuthEvent::AuthorizationRequired);
        assert!(rx.try_recv().is_err());

        signer.post_call(json!({ "Ok": 1 }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_goes_through_multiplexer() {
        let channel = Arc::new(InMemoryChannel::new());
        channel.respond_with("holo/call", json!({ "Ok": "done" }));
        let (signer, _rx, _) = bound_signer(&channel).await;

        let response = signer.call("inst/zome/fn", json!([1, 2])).await.unwrap();
        assert_eq!(response, json!({ "Ok": "done" }));

        let calls = channel.calls_to("holo/call");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params["function"], "fn");
        assert!(channel.calls_to("inst/zome/fn").is_empty());
    }

    #[tokio::test]
    async fn test_post_call_without_listener() {
        let channel = Arc::new(InMemoryChannel::new());
        let (signer, rx, _) = bound_signer(&channel).await;
        drop(rx);

        let response = json!({ "Err": { "code": 401 } });
        assert_eq!(signer.post_call(response.clone()), response);
    }
}
