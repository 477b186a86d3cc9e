//! # Message Validation
//!
//! [`Validator`] decides whether one [`StreamMessage`] may enter the ordering
//! stage. It consults three injected lookups (stream metadata, publisher role,
//! subscriber role), each memoized in a [`TtlCache`] owned by the validator,
//! and the injected [`SignatureVerifier`].
//!
//! ## Check Order
//!
//! | Kind | Checks |
//! |------|--------|
//! | Data | signed-data policy, encryption policy, partition range, signature, publisher role |
//! | Group key request | signed, key-exchange stream, signature, recipient publishes, sender subscribes |
//! | Group key response/announce | signed, key-exchange stream, signature, sender publishes, recipient subscribes |
//! | Group key error response | as response, without the recipient-subscriber check |
//! | Unknown | always rejected |
//!
//! The recipient of a key exchange is the address in the stream name
//! `SYSTEM/keyexchange/{address}`.
//!
//! ## Ordered Completion
//!
//! Lookups finish in any order. [`OrderedValidations`] runs validations
//! concurrently but hands results back strictly in the order messages were
//! pushed, so the ordering stage never sees a later message's verdict first.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::cache::TtlCache;
use crate::config::{PipelineConfig, SignaturePolicy};
use crate::error::ValidationError;
use crate::identity::Identity;
use crate::messages::{EncryptionType, KEY_EXCHANGE_STREAM_PREFIX, MessageKind, StreamMessage};
use crate::protocols::{SignatureVerifier, StreamMetadata, StreamRegistry};

/// Verdict on one message, paired with the message.
pub type ValidationOutcome = (StreamMessage, Result<(), ValidationError>);

type RoleKey = (Identity, String);

pub struct Validator {
    registry: Arc<dyn StreamRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    policy: SignaturePolicy,
    streams: TtlCache<String, StreamMetadata>,
    publishers: TtlCache<RoleKey, bool>,
    subscribers: TtlCache<RoleKey, bool>,
}

impl Validator {
    pub fn new(
        registry: Arc<dyn StreamRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            registry,
            verifier,
            policy: config.verify_signatures,
            streams: TtlCache::new(config.cache_max_size, config.cache_max_age),
            publishers: TtlCache::new(config.cache_max_size, config.cache_max_age),
            subscribers: TtlCache::new(config.cache_max_size, config.cache_max_age),
        }
    }

    pub fn policy(&self) -> SignaturePolicy {
        self.policy
    }

    pub async fn validate(&self, message: &StreamMessage) -> Result<(), ValidationError> {
        if message.stream_id.is_empty() {
            return Err(ValidationError::Malformed("empty stream id".to_string()));
        }

        if self.policy == SignaturePolicy::Always && !message.is_signed() {
            return Err(ValidationError::SignatureRequired(format!(
                "unsigned {} message from {}",
                message.kind.name(),
                message.publisher_id.short()
            )));
        }

        match &message.kind {
            MessageKind::Data => {
                if self.policy == SignaturePolicy::Never {
                    return Ok(());
                }
                self.validate_data(message).await
            }
            MessageKind::GroupKeyRequest { stream_id } => {
                self.validate_key_request(message, stream_id).await
            }
            MessageKind::GroupKeyResponse { stream_id } | MessageKind::GroupKeyAnnounce { stream_id } => {
                self.validate_key_response(message, stream_id, true).await
            }
            MessageKind::GroupKeyErrorResponse { stream_id } => {
                self.validate_key_response(message, stream_id, false).await
            }
            MessageKind::Unknown(tag) => Err(ValidationError::UnknownMessageKind(*tag)),
        }
    }

    async fn validate_data(&self, message: &StreamMessage) -> Result<(), ValidationError> {
        let stream = self.stream(&message.stream_id).await?;

        if stream.require_signed_data && !message.is_signed() {
            return Err(ValidationError::SignatureRequired(format!(
                "stream {} requires signed data",
                message.stream_id
            )));
        }

        if message.encryption == EncryptionType::None && stream.require_encrypted_data {
            return Err(ValidationError::EncryptionRequired(message.stream_id.clone()));
        }

        if message.stream_partition >= stream.partition_count {
            return Err(ValidationError::PartitionOutOfRange {
                partition: message.stream_partition,
                partition_count: stream.partition_count,
            });
        }

        // Unsigned data that the stream does not require to be signed cannot be
        // attributed, so there is nothing further to check.
        if !message.is_signed() {
            return Ok(());
        }

        self.verify_signature(message).await?;

        if !self.is_publisher(&message.publisher_id, &message.stream_id).await? {
            return Err(ValidationError::UnauthorizedPublisher {
                publisher: message.publisher_id.short(),
                stream_id: message.stream_id.clone(),
            });
        }

        Ok(())
    }

    async fn validate_key_request(
        &self,
        message: &StreamMessage,
        target_stream: &str,
    ) -> Result<(), ValidationError> {
        let recipient = self.key_exchange_preamble(message).await?;
        let sender = message.publisher_id;

        if !self.is_publisher(&recipient, target_stream).await? {
            return Err(ValidationError::UnauthorizedKeyExchangeParty(format!(
                "recipient {} is not a publisher on {}",
                recipient.short(),
                target_stream
            )));
        }
        if !self.is_subscriber(&sender, target_stream).await? {
            return Err(ValidationError::UnauthorizedKeyExchangeParty(format!(
                "sender {} is not a subscriber on {}",
                sender.short(),
                target_stream
            )));
        }
        Ok(())
    }

    async fn validate_key_response(
        &self,
        message: &StreamMessage,
        target_stream: &str,
        check_recipient: bool,
    ) -> Result<(), ValidationError> {
        let recipient = self.key_exchange_preamble(message).await?;
        let sender = message.publisher_id;

        if !self.is_publisher(&sender, target_stream).await? {
            return Err(ValidationError::UnauthorizedKeyExchangeParty(format!(
                "sender {} is not a publisher on {}",
                sender.short(),
                target_stream
            )));
        }
        // A publisher may tell an invalid subscriber that it is invalid.
        if check_recipient && !self.is_subscriber(&recipient, target_stream).await? {
            return Err(ValidationError::UnauthorizedKeyExchangeParty(format!(
                "recipient {} is not a subscriber on {}",
                recipient.short(),
                target_stream
            )));
        }
        Ok(())
    }

    /// Checks shared by every key-exchange kind. Returns the recipient address.
    async fn key_exchange_preamble(&self, message: &StreamMessage) -> Result<Identity, ValidationError> {
        if !message.is_signed() {
            return Err(ValidationError::SignatureRequired(format!(
                "{} must be signed",
                message.kind.name()
            )));
        }

        let Some(address) = message.stream_id.strip_prefix(KEY_EXCHANGE_STREAM_PREFIX) else {
            return Err(ValidationError::UnauthorizedKeyExchangeParty(format!(
                "{} sent on non key-exchange stream {}",
                message.kind.name(),
                message.stream_id
            )));
        };
        let recipient = Identity::from_hex(address).map_err(|_| {
            ValidationError::UnauthorizedKeyExchangeParty(format!("invalid recipient address {}", address))
        })?;

        self.verify_signature(message).await?;
        Ok(recipient)
    }

    async fn verify_signature(&self, message: &StreamMessage) -> Result<(), ValidationError> {
        let signature = message.signature.as_deref().unwrap_or_default();
        let payload = message.payload_to_sign();
        match self.verifier.verify(&message.publisher_id, &payload, signature).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ValidationError::InvalidSignature {
                publisher: message.publisher_id.short(),
                reason: "signature does not match payload".to_string(),
            }),
            Err(e) => Err(ValidationError::InvalidSignature {
                publisher: message.publisher_id.short(),
                reason: format!("{:#}", e),
            }),
        }
    }

    async fn stream(&self, stream_id: &str) -> Result<StreamMetadata, ValidationError> {
        self.streams
            .get_or_try_fetch(stream_id.to_string(), || self.registry.get_stream(stream_id))
            .await
            .map_err(|e| ValidationError::Lookup(format!("stream {}: {:#}", stream_id, e)))
    }

    async fn is_publisher(&self, address: &Identity, stream_id: &str) -> Result<bool, ValidationError> {
        trace!(address = %address.short(), stream = %stream_id, "publisher lookup");
        self.publishers
            .get_or_try_fetch((*address, stream_id.to_string()), || {
                self.registry.is_publisher(address, stream_id)
            })
            .await
            .map_err(|e| ValidationError::Lookup(format!("publisher {}: {:#}", address.short(), e)))
    }

    async fn is_subscriber(&self, address: &Identity, stream_id: &str) -> Result<bool, ValidationError> {
        trace!(address = %address.short(), stream = %stream_id, "subscriber lookup");
        self.subscribers
            .get_or_try_fetch((*address, stream_id.to_string()), || {
                self.registry.is_subscriber(address, stream_id)
            })
            .await
            .map_err(|e| ValidationError::Lookup(format!("subscriber {}: {:#}", address.short(), e)))
    }
}

/// Concurrent validations whose results are yielded in push order.
///
/// `next` is cancel safe: a result is only removed once it is returned.
pub struct OrderedValidations {
    validator: Arc<Validator>,
    pending: VecDeque<JoinHandle<ValidationOutcome>>,
}

impl OrderedValidations {
    pub fn new(validator: Arc<Validator>) -> Self {
        Self {
            validator,
            pending: VecDeque::new(),
        }
    }

    /// Start validating `message` in the background.
    pub fn push(&mut self, message: StreamMessage) {
        let validator = self.validator.clone();
        self.pending.push_back(tokio::spawn(async move {
            let result = validator.validate(&message).await;
            (message, result)
        }));
    }

    /// Wait for the oldest outstanding validation. Returns `None` when idle.
    pub async fn next(&mut self) -> Option<ValidationOutcome> {
        loop {
            let front = self.pending.front_mut()?;
            let joined = front.await;
            self.pending.pop_front();
            match joined {
                Ok(outcome) => return Some(outcome),
                Err(e) => warn!(error = %e, "validation task failed"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Abort every outstanding validation.
    pub fn clear(&mut self) {
        for handle in self.pending.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for OrderedValidations {
    fn drop(&mut self) {
        self.clear();
    }
}
