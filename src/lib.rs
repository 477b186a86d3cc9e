//! # Gapless - Ordered, Validated Stream Subscriptions
//!
//! Gapless turns the unordered, duplicate-prone, gap-prone message feed of a
//! publish/subscribe network into one strictly ordered, validated,
//! exactly-once sequence per subscription:
//!
//! - **Validation**: signature, permission and stream-policy checks with memoized lookups
//! - **Ordering**: per-lineage reordering along each producer's `prev_ref` chain
//! - **Gap filling**: bounded, retried resend requests for missing ranges
//! - **Composition**: one cancellable pipeline per subscription
//!
//! ## Architecture
//!
//! Each pipeline run follows the **Actor Pattern**:
//! - [`MessagePipeline`] is the consumer handle; the run is a task that owns all state
//! - Validations and resend attempts are spawned tasks reporting back over channels
//! - Network, permissions and crypto are injected through the traits in [`protocols`]
//!
//! ## Guarantees
//!
//! - Validation verdicts reach the ordering stage in arrival order
//! - Within a lineage a message never precedes its declared predecessor
//! - Each message is delivered at most once
//! - A stalled lineage never blocks other lineages
//! - Cancelling a run releases every handler and request handle it took
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `subscription` | Subscribe handshake and pipeline lifecycle |
//! | `pipeline` | Pipeline actor, post-processing stages, collect |
//! | `validator` | Message validation and ordered completion |
//! | `ordering` | Per-lineage ordering state machine |
//! | `resend` | Gap-fill resend attempts |
//! | `cache` | TTL-bounded memoization of async lookups |
//! | `connection` | In-process `Connection` hub |
//! | `protocols` | Capability traits (`Connection`, `StreamRegistry`, `SignatureVerifier`) |
//! | `messages` | Stream and control message types |
//! | `identity` | Keypairs and publisher identities |
//! | `crypto` | Domain-separated Ed25519 signing and verification |
//! | `config` | Pipeline configuration and limits |
//! | `error` | Validation and pipeline error types |

mod cache;
mod config;
mod connection;
mod crypto;
mod error;
mod identity;
mod messages;
mod ordering;
mod pipeline;
pub mod protocols;
mod resend;
mod subscription;
mod validator;

pub use cache::TtlCache;
pub use config::{
    Delivery, PipelineConfig, PipelineOptions, SignaturePolicy, DEFAULT_CACHE_MAX_AGE,
    DEFAULT_CACHE_MAX_SIZE, DEFAULT_GAP_FILL_TIMEOUT, DEFAULT_MAX_BUFFERED_PER_LINEAGE,
    DEFAULT_MAX_GAP_REQUESTS, DEFAULT_OUTPUT_BUFFER, DEFAULT_RESPONSE_TIMEOUT,
    DEFAULT_TEARDOWN_TIMEOUT, MAX_LINEAGES, MAX_PENDING_VALIDATIONS,
};
pub use connection::{ConnectionHub, MAX_REQUEST_HANDLES};
pub use crypto::{
    sign_stream_message, sign_with_domain, verify_with_domain, Ed25519Verifier, SignatureError,
    STREAM_MESSAGE_SIGNATURE_DOMAIN,
};
pub use error::{PipelineError, ValidationError};
pub use identity::{Identity, Keypair};
pub use messages::{
    encode_content, is_key_exchange_stream, ControlKind, ControlMessage, ControlRequest,
    EncryptionType, LineageKey, MessageId, MessageKind, MessageRef, RequestId, StreamMessage,
    KEY_EXCHANGE_STREAM_PREFIX, MAX_CONTENT_SIZE,
};
pub use ordering::{GapRequest, GapRetry, OrderingEngine, OrderingEvent};
pub use pipeline::{FnStage, MessagePipeline, PipelineStage};
pub use protocols::{Connection, HandlerId, SignatureVerifier, StreamMetadata, StreamRegistry};
pub use resend::{ResendCoordinator, ResendEvent, ResendOutcome};
pub use subscription::{Subscriber, Subscription};
pub use validator::{OrderedValidations, ValidationOutcome, Validator};
