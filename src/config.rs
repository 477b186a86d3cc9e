//! Pipeline configuration.
//!
//! [`PipelineConfig`] is shared by every run a [`Subscriber`](crate::Subscriber)
//! starts; [`PipelineOptions`] describes one run.

use std::time::Duration;

use crate::messages::ControlKind;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Time one resend attempt may take before the next attempt is issued.
pub const DEFAULT_GAP_FILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Resend attempts per gap before the gap is abandoned.
pub const DEFAULT_MAX_GAP_REQUESTS: u32 = 10;

/// Entries per validator lookup cache.
pub const DEFAULT_CACHE_MAX_SIZE: usize = 10_000;

/// Lifetime of a memoized lookup result.
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Ordered messages buffered for the consumer before the run applies back-pressure.
pub const DEFAULT_OUTPUT_BUFFER: usize = 256;

/// Time to wait for a subscribe/unsubscribe acknowledgement.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time teardown waits for resend sub-streams to release their handles.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Security Limits
// ============================================================================

/// Maximum out-of-order messages buffered per lineage.
/// SECURITY: A publisher that never fills its gaps cannot grow the buffer without bound.
pub const DEFAULT_MAX_BUFFERED_PER_LINEAGE: usize = 10_000;

/// Maximum lineages tracked per stream partition.
/// SECURITY: Bounds the lineage table against chain-id proliferation.
pub const MAX_LINEAGES: usize = 10_000;

/// Maximum validations in flight per run.
pub const MAX_PENDING_VALIDATIONS: usize = 1_000;

/// When signatures are checked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignaturePolicy {
    /// Validate according to the stream's metadata.
    #[default]
    Auto,
    /// Reject unsigned messages outright, then validate.
    Always,
    /// Accept data messages without validation. Key-exchange messages are
    /// still validated.
    Never,
}

/// Which inbound control messages feed a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Delivery {
    #[default]
    Broadcast,
    Unicast,
}

impl Delivery {
    pub fn control_kind(self) -> ControlKind {
        match self {
            Delivery::Broadcast => ControlKind::BroadcastMessage,
            Delivery::Unicast => ControlKind::UnicastMessage,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Time one resend attempt may take.
    pub gap_fill_timeout: Duration,
    /// Resend attempts per gap.
    pub max_gap_requests: u32,
    /// Entries per validator lookup cache.
    pub cache_max_size: usize,
    /// Lifetime of a memoized lookup.
    pub cache_max_age: Duration,
    pub verify_signatures: SignaturePolicy,
    /// When false, messages pass through in arrival order (duplicates still dropped).
    pub order_messages: bool,
    pub max_buffered_per_lineage: usize,
    pub output_buffer: usize,
    pub response_timeout: Duration,
    pub teardown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gap_fill_timeout: DEFAULT_GAP_FILL_TIMEOUT,
            max_gap_requests: DEFAULT_MAX_GAP_REQUESTS,
            cache_max_size: DEFAULT_CACHE_MAX_SIZE,
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
            verify_signatures: SignaturePolicy::Auto,
            order_messages: true,
            max_buffered_per_lineage: DEFAULT_MAX_BUFFERED_PER_LINEAGE,
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

/// One run's stream partition and delivery type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOptions {
    pub stream_id: String,
    pub stream_partition: u32,
    pub delivery: Delivery,
    /// Prefix for request ids issued by this run.
    pub key: String,
}

impl PipelineOptions {
    pub fn new(stream_id: impl Into<String>, stream_partition: u32) -> Self {
        let stream_id = stream_id.into();
        let key = format!("{}-{}", stream_id, stream_partition);
        Self {
            stream_id,
            stream_partition,
            delivery: Delivery::Broadcast,
            key,
        }
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let config = PipelineConfig::default();
        assert_eq!(config.gap_fill_timeout, DEFAULT_GAP_FILL_TIMEOUT);
        assert_eq!(config.max_gap_requests, DEFAULT_MAX_GAP_REQUESTS);
        assert!(config.max_gap_requests > 0);
        assert!(config.cache_max_size > 0);
        assert!(config.output_buffer > 0);
        assert!(config.order_messages);
        assert_eq!(config.verify_signatures, SignaturePolicy::Auto);
        assert!(config.teardown_timeout < config.response_timeout);
    }

    #[test]
    fn options_derive_key_from_stream_partition() {
        let options = PipelineOptions::new("sensors", 3);
        assert_eq!(options.key, "sensors-3");
        assert_eq!(options.delivery, Delivery::Broadcast);

        let options = options.with_delivery(Delivery::Unicast).with_key("custom");
        assert_eq!(options.key, "custom");
        assert_eq!(options.delivery.control_kind(), ControlKind::UnicastMessage);
    }
}
