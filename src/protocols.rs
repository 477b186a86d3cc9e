//! Capability traits consumed by the pipeline.
//!
//! The pipeline never talks to a socket, a permission store or a crypto
//! library directly. Each collaborator is injected behind one of these traits.
//!
//! ## Capability Traits
//!
//! | Capability | Trait | Purpose |
//! |------------|-------|---------|
//! | Connection | [`Connection`] | Typed handler registration, request handles, request sending |
//! | Metadata | [`StreamRegistry`] | Stream metadata and publish/subscribe permissions |
//! | Crypto | [`SignatureVerifier`] | Signature verification against a publisher address |
//!
//! ## Design
//!
//! Traits are defined here separately from implementations to:
//! - Allow the validator and resend logic to depend only on traits
//! - Let tests substitute in-memory collaborators with injected latency or failures
//! - Keep transport and storage choices out of the ordering core

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::identity::Identity;
use crate::messages::{ControlKind, ControlMessage, ControlRequest};

/// Registration token returned by [`Connection::on`].
pub type HandlerId = u64;

/// Connection to the network, as seen by one client.
///
/// Handler registration is synchronous and local; `send` is fire-and-forget,
/// with acknowledgements arriving later as typed [`ControlMessage`]s.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Deliver every inbound message of `kind` to `handler`.
    fn on(&self, kind: ControlKind, handler: mpsc::Sender<ControlMessage>) -> HandlerId;

    /// Remove a handler registered with [`Connection::on`]. Unknown ids are ignored.
    fn off(&self, kind: ControlKind, id: HandlerId);

    /// Declare interest in unicast traffic tagged with `request_id`.
    async fn add_request_handle(&self, request_id: &str) -> Result<()>;

    /// Release a request handle. Releasing an unknown handle is not an error.
    async fn remove_request_handle(&self, request_id: &str) -> Result<()>;

    /// Send a request to the network.
    async fn send(&self, request: ControlRequest) -> Result<()>;
}

/// Validation-relevant metadata of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub partition_count: u32,
    pub require_signed_data: bool,
    pub require_encrypted_data: bool,
}

impl Default for StreamMetadata {
    fn default() -> Self {
        Self {
            partition_count: 1,
            require_signed_data: false,
            require_encrypted_data: false,
        }
    }
}

/// Stream metadata and permission lookups.
#[async_trait]
pub trait StreamRegistry: Send + Sync + 'static {
    async fn get_stream(&self, stream_id: &str) -> Result<StreamMetadata>;

    /// Returns true if `address` may publish to `stream_id`.
    async fn is_publisher(&self, address: &Identity, stream_id: &str) -> Result<bool>;

    /// Returns true if `address` may subscribe to `stream_id`.
    async fn is_subscriber(&self, address: &Identity, stream_id: &str) -> Result<bool>;
}

/// Signature verification against a publisher address.
#[async_trait]
pub trait SignatureVerifier: Send + Sync + 'static {
    /// Returns true if `signature` over `payload` was produced by `address`.
    /// An `Err` means verification could not be performed.
    async fn verify(&self, address: &Identity, payload: &[u8], signature: &[u8]) -> Result<bool>;
}
