//! # Message Signatures
//!
//! This module provides the signature primitives used for stream messages:
//!
//! - **Signing**: Domain-separated Ed25519 signatures over a message's
//!   canonical payload (see [`StreamMessage::payload_to_sign`])
//! - **Verification**: [`Ed25519Verifier`], the default [`SignatureVerifier`]
//!   injected into the validator
//!
//! ## Identity Model
//!
//! - **Address = Public Key**: the 32-byte Ed25519 public key IS the publisher address
//! - Only Ed25519 signatures are accepted (64 bytes, strict verification)
//! - Domain separation prevents cross-protocol signature replay

use anyhow::Result;
use async_trait::async_trait;
use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Identity, Keypair};
use crate::messages::StreamMessage;
use crate::protocols::SignatureVerifier;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain separation prefix for stream message signatures.
pub const STREAM_MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"gapless-stream-message-v1:";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing.
///
/// # Returns
/// 64-byte Ed25519 signature as a Vec<u8>
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// # Returns
/// `Ok(())` if signature is valid, `Err(SignatureError)` otherwise
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(identity.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Sign a stream message in place, overwriting any previous signature.
///
/// The message's `publisher_id` must be the keypair's identity for the
/// signature to verify.
pub fn sign_stream_message(keypair: &Keypair, message: &mut StreamMessage) {
    let payload = message.payload_to_sign();
    message.signature = Some(sign_with_domain(keypair, STREAM_MESSAGE_SIGNATURE_DOMAIN, &payload));
}

/// Ed25519 verifier for stream message payloads.
///
/// A malformed signature or public key is reported as `Ok(false)`: the
/// message is wrong, the verifier is not.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

#[async_trait]
impl SignatureVerifier for Ed25519Verifier {
    async fn verify(&self, address: &Identity, payload: &[u8], signature: &[u8]) -> Result<bool> {
        Ok(verify_with_domain(address, STREAM_MESSAGE_SIGNATURE_DOMAIN, payload, signature).is_ok())
    }
}
