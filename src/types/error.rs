//! Error types for the signing wormhole

/// Main error type for wormhole operations
#[derive(Debug, thiserror::Error)]
pub enum WormholeError {
    /// Signing or decryption attempted on a public-only keypair
    #[error("Keypair has no private key")]
    NoPrivateKey,

    /// No wrapped-secret slot in a box could be opened with our key
    #[error("Not a recipient of this message")]
    NotARecipient,

    /// Wrong passphrase or tampered bundle
    #[error("Authenticated decryption failed")]
    AuthDecryptionFailure,

    #[error("No open channel")]
    NoChannel,

    #[error("No keypair bound to session")]
    NoKeys,

    /// Regenerate attempted for an email that never registered a salt
    #[error("No salt registration found for {0}")]
    RegistrationNotFound(String),

    /// Host answered with a 401-style error
    #[error("Authorization required")]
    AuthorizationRequired,

    #[error("Entropy length mismatch: expected {expected}, got {got}")]
    EntropyLength { expected: usize, got: usize },

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Invalid call method: {0}")]
    InvalidMethod(String),

    /// Regenerated identity does not match the one the caller expected
    #[error("Identity mismatch: expected {expected}, derived {derived}")]
    IdentityMismatch { expected: String, derived: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Salt service error: {0}")]
    SaltService(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WormholeError {
    /// Whether the failure came from the crypto layer rather than the protocol
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Self::NoPrivateKey
                | Self::NotARecipient
                | Self::AuthDecryptionFailure
                | Self::MalformedCiphertext(_)
                | Self::Crypto(_)
        )
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for WormholeError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for WormholeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for WormholeError {
    fn from(err: reqwest::Error) -> Self {
        Self::SaltService(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for WormholeError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Internal(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for WormholeError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::MalformedCiphertext(format!("MessagePack decode error: {}", err))
    }
}

impl From<tokio::task::JoinError> for WormholeError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Task failed: {}", err))
    }
}

/// Result type alias for wormhole operations
pub type Result<T> = std::result::Result<T, WormholeError>;
