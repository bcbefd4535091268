// Copyright (c) 2026 Conclave Contributors
// SPDX-License-Identifier: Apache-2.0

//! Client-signature verification.
//!
//! Callers sign the digest of the serialised request with the key their
//! certificate carries. Verifiers are cached per caller id under a single
//! lock and shared; a verifier is constructed at most once per caller over
//! the frontend's lifetime.

use crate::context::{DigestAlgorithm, KeyDigest, SignedRequest};
use conclave_kv::CallerId;
use ed25519_dalek::{Signature, VerifyingKey};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Headers that must be covered by a request signature, advertised in
/// `WWW-Authenticate` challenges.
pub const REQUIRED_SIGNATURE_HEADERS: [&str; 2] = ["(request-target)", "digest"];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("caller certificate does not carry a valid verification key")]
    MalformedCert,
}

/// Verifies detached request signatures for one caller.
pub struct RequestVerifier {
    key: VerifyingKey,
}

impl RequestVerifier {
    /// The certificate is the caller's raw ed25519 verification key.
    pub fn from_cert(cert: &[u8]) -> Result<Self, AuthError> {
        let bytes: [u8; 32] = cert.try_into().map_err(|_| AuthError::MalformedCert)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| AuthError::MalformedCert)?;
        Ok(Self { key })
    }

    /// Digest of the verification key, as carried in `SignedRequest::key_id`.
    pub fn key_digest(&self) -> KeyDigest {
        Sha256::digest(self.key.as_bytes()).into()
    }

    pub fn verify(&self, req: &[u8], sig: &[u8], md: DigestAlgorithm) -> bool {
        let Ok(signature) = Signature::from_slice(sig) else {
            return false;
        };
        let material: [u8; 32] = match md {
            DigestAlgorithm::Sha256 => Sha256::digest(req).into(),
        };
        self.key.verify_strict(&material, &signature).is_ok()
    }

    pub fn verify_signed_request(&self, signed: &SignedRequest) -> bool {
        self.verify(&signed.req, &signed.sig, signed.md)
    }
}

/// Shared caller-id → verifier mapping. The lock is held only for the
/// cache probe; verification runs on the shared handle outside it.
#[derive(Default)]
pub struct VerifierCache {
    verifiers: Mutex<HashMap<CallerId, Arc<RequestVerifier>>>,
}

impl VerifierCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verifier_for(
        &self,
        caller_id: CallerId,
        caller_cert: &[u8],
    ) -> Result<Arc<RequestVerifier>, AuthError> {
        let mut verifiers = self.verifiers.lock();
        if let Some(verifier) = verifiers.get(&caller_id) {
            return Ok(Arc::clone(verifier));
        }
        let verifier = Arc::new(RequestVerifier::from_cert(caller_cert)?);
        verifiers.insert(caller_id, Arc::clone(&verifier));
        Ok(verifier)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.verifiers.lock().len()
    }
}
