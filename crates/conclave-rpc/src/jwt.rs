// Copyright (c) 2026 Conclave Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bearer-token authentication.
//!
//! Tokens are EdDSA-signed JWTs. Extraction and structural checks happen
//! here; key lookup walks the store-backed JWKS tables, so token validity
//! follows governance state without restarts.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtHeader {
    pub alg: String,
    pub kid: String,
    #[serde(default)]
    pub typ: Option<String>,
}

/// A structurally valid token, not yet checked against any key.
#[derive(Debug, Clone)]
pub struct JwtToken {
    pub header: JwtHeader,
    pub payload: serde_json::Value,
    /// `<header>.<payload>`, the bytes the signature covers.
    signed_content: String,
    signature: Vec<u8>,
}

/// A token that passed signature validation, plus the issuer its signing
/// key is registered under.
#[derive(Debug, Clone)]
pub struct Jwt {
    pub key_issuer: String,
    pub header: JwtHeader,
    pub payload: serde_json::Value,
}

/// Pull a bearer token out of the request headers. The error string is the
/// reason reported in the `401` body.
pub fn extract_token(headers: &BTreeMap<String, String>) -> Result<JwtToken, String> {
    let authorization = headers
        .get("authorization")
        .ok_or_else(|| "Missing Authorization header".to_string())?;
    let token = authorization
        .strip_prefix("Bearer ")
        .ok_or_else(|| "Authorization header is not a Bearer token".to_string())?;

    let mut segments = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err("Bearer token is not a valid JWT".to_string());
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|_| "JWT header is malformed".to_string())?;
    let header: JwtHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| "JWT header is malformed".to_string())?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| "JWT payload is malformed".to_string())?;
    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)
        .map_err(|_| "JWT payload is malformed".to_string())?;

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| "JWT signature is malformed".to_string())?;

    let signed_content = match token.rfind('.') {
        Some(end) => token[..end].to_string(),
        None => String::new(),
    };

    Ok(JwtToken {
        header,
        payload,
        signed_content,
        signature,
    })
}

/// Check the token signature against a raw ed25519 verification key from
/// the JWKS table.
pub fn validate_token_signature(token: &JwtToken, key: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&token.signature) else {
        return false;
    };
    key.verify_strict(token.signed_content.as_bytes(), &signature)
        .is_ok()
}
