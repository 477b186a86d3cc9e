use thiserror::Error;

use crate::messages::MessageRef;

/// Why a message failed validation.
///
/// Every variant is recoverable: the message is dropped and its lineage
/// advances past it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message must be signed: {0}")]
    SignatureRequired(String),

    #[error("invalid signature from {publisher}: {reason}")]
    InvalidSignature { publisher: String, reason: String },

    #[error("{publisher} is not a publisher on stream {stream_id}")]
    UnauthorizedPublisher { publisher: String, stream_id: String },

    #[error("unauthorized key exchange: {0}")]
    UnauthorizedKeyExchangeParty(String),

    #[error("partition {partition} is out of range (0..{partition_count})")]
    PartitionOutOfRange { partition: u32, partition_count: u32 },

    #[error("stream {0} requires encrypted data")]
    EncryptionRequired(String),

    #[error("unknown message kind {0}")]
    UnknownMessageKind(u8),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Errors surfaced by a pipeline run or a subscription.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// A gap could not be filled within the retry budget. Logged; the
    /// lineage is force-advanced and the run continues.
    #[error("gap ({from}, {to}] on {lineage} not filled after {attempts} attempts")]
    GapFillExhausted {
        lineage: String,
        from: MessageRef,
        to: MessageRef,
        attempts: u32,
    },

    #[error("connection failure: {0}")]
    ConnectionFailure(#[source] anyhow::Error),

    #[error("pipeline stage {stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("pipeline is already being collected")]
    AlreadyCollecting,

    #[error("pipeline closed")]
    Closed,

    #[error("no response to request {0} in time")]
    ResponseTimeout(String),

    #[error("request {request_id} failed: {message}")]
    ErrorResponse { request_id: String, message: String },

    #[error("failed to decode message content: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_render_context() {
        let err = ValidationError::PartitionOutOfRange { partition: 4, partition_count: 2 };
        assert_eq!(err.to_string(), "partition 4 is out of range (0..2)");

        let err = ValidationError::UnauthorizedPublisher {
            publisher: "abcd".into(),
            stream_id: "stream".into(),
        };
        assert_eq!(err.to_string(), "abcd is not a publisher on stream stream");
    }

    #[test]
    fn pipeline_errors_render_context() {
        let err = PipelineError::GapFillExhausted {
            lineage: "abcd/chain".into(),
            from: MessageRef::new(1, 2),
            to: MessageRef::new(1, 3),
            attempts: 2,
        };
        assert_eq!(err.to_string(), "gap (1:2, 1:3] on abcd/chain not filled after 2 attempts");
        assert_eq!(PipelineError::AlreadyCollecting.to_string(), "pipeline is already being collected");
    }
}
