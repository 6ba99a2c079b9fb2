//! Configuration for the wormhole
//!
//! CLI arguments and environment variable handling using clap, plus the
//! fixed key-derivation parameters shared by registration and regeneration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::types::{Result, WormholeError};

/// Host-side multiplexing method every application call is redirected to
pub const DEFAULT_CALL_METHOD: &str = "holo/call";

/// Doorway Wormhole - agent identity and signing for hosted apps
#[derive(Parser, Debug, Clone)]
#[command(name = "doorway-wormhole")]
#[command(about = "Derive agent identities and manage encrypted key bundles")]
pub struct Args {
    /// Base URL of the remote entropy / salt registration service
    #[arg(long, env = "SALT_SERVICE_URL", default_value = "http://localhost:8090")]
    pub salt_service_url: String,

    /// hApp identifier announced to hosts
    #[arg(long, env = "HAPP_ID", default_value = "elohim")]
    pub happ_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Salt service request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

/// Operator commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Derive an anonymous (readonly) identity from combined entropy
    Readonly,

    /// Derive a new readwrite identity and register its salt
    Signup {
        #[arg(long, env = "WORMHOLE_EMAIL")]
        email: String,
        #[arg(long, env = "WORMHOLE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Regenerate a readwrite identity from the registered salt
    Login {
        #[arg(long, env = "WORMHOLE_EMAIL")]
        email: String,
        #[arg(long, env = "WORMHOLE_PASSWORD", hide_env_values = true)]
        password: String,
        /// Fail unless the regenerated identity equals this one
        #[arg(long)]
        expect: Option<String>,
    },

    /// Regenerate a readwrite identity and write it as an encrypted bundle
    ExportBundle {
        #[arg(long, env = "WORMHOLE_EMAIL")]
        email: String,
        #[arg(long, env = "WORMHOLE_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, env = "WORMHOLE_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
        #[arg(long, default_value = "")]
        hint: String,
        #[arg(long)]
        out: PathBuf,
    },

    /// Decrypt a bundle and print its identity
    InspectBundle {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, env = "WORMHOLE_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.salt_service_url.starts_with("http://")
            || self.salt_service_url.starts_with("https://"))
        {
            return Err("SALT_SERVICE_URL must be an http(s) URL".to_string());
        }

        if self.happ_id.trim().is_empty() {
            return Err("HAPP_ID must not be empty".to_string());
        }

        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Session settings derived from the CLI
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.happ_id.clone())
    }
}

// =============================================================================
// Key derivation parameters
// =============================================================================

/// Argon2id work factors.
///
/// Registration and regeneration must hash with identical values or the
/// same password yields a different identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Iteration count
    pub iterations: u32,
    /// Lanes
    pub parallelism: u32,
}

impl KdfParams {
    /// Version 1: 64 MB, 3 iterations, 4 lanes (same as doorway custodial keys)
    pub const V1: KdfParams = KdfParams {
        memory_kib: 65536,
        iterations: 3,
        parallelism: 4,
    };

    /// Build the argon2 hasher for these parameters with a 32-byte output.
    pub fn argon2(&self) -> Result<argon2::Argon2<'static>> {
        let params = argon2::Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(32),
        )
        .map_err(|e| WormholeError::Config(format!("Invalid Argon2 params: {e}")))?;

        Ok(argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            params,
        ))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::V1
    }
}

// =============================================================================
// Session configuration
// =============================================================================

/// Identifiers and method names used when talking to a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// hApp identifier placed in every call envelope
    pub happ_id: String,
    /// Multiplexing method every call is sent through
    pub call_method: String,
}

impl SessionConfig {
    pub fn new(happ_id: impl Into<String>) -> Self {
        Self {
            happ_id: happ_id.into(),
            call_method: DEFAULT_CALL_METHOD.to_string(),
        }
    }
}
