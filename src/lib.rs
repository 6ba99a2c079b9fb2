//! Doorway Wormhole - agent identity and signing for hosted Holochain apps
//!
//! A browser-side agent keeps its private keys local and proves its identity
//! to a doorway host over a persistent channel. The host pushes payloads to
//! sign and receives back only signatures.
//!
//! ## Modules
//!
//! - **entropy**: local and remote entropy, XOR combination, salt registry
//! - **identity**: readonly, password-backed and regenerated identities
//! - **keypair**: Ed25519 + X25519 keypair, multi-recipient boxes, bundles
//! - **session**: the signing wormhole over an abstract channel
//! - **envelope**: signed call envelopes and 401 handling

pub mod config;
pub mod entropy;
pub mod envelope;
pub mod identity;
pub mod keypair;
pub mod primitives;
pub mod session;
pub mod types;

pub use config::{Args, KdfParams, SessionConfig};
pub use entropy::{Entropy, EntropySource, SaltRegistry, SaltServiceClient};
pub use envelope::{AuthEvent, CallEnvelope, CallSigner};
pub use identity::{IdentityDeriver, Registration, SaltRegistration};
pub use keypair::{AgentIdentity, Keypair, PersistenceBundle};
pub use session::{Channel, InMemoryChannel, Session};
pub use types::{Result, WormholeError};
