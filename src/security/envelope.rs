//! Signed request envelope carried on every privileged head→node call.
//!
//! Two headers travel with the request:
//!   - `X-WebAI-Signature`: base64 Ed25519 signature over the canonical string
//!   - `X-WebAI-Sig-Meta`: base64url(JSON `{ ts, nonce, key_id, body_sha256 }`)
//!
//! Canonical string: `METHOD\nPATH_AND_QUERY\nBODY_SHA256\nTS\nNONCE\nKEY_ID`.
//! `ts` is UTC unix seconds. Acceptance: clock skew within 60 s, nonce unseen
//! within the sliding replay window, body hash matching the raw bytes.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::keys::{HeadKeypair, KeyRing};
use super::nonce::NonceWindow;
use crate::error::AuthErrorKind;

pub const SIGNATURE_HEADER: &str = "x-webai-signature";
pub const META_HEADER: &str = "x-webai-sig-meta";

/// Maximum tolerated difference between the envelope timestamp and node time.
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 60;

/// Signed metadata carried in `X-WebAI-Sig-Meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigMeta {
    pub ts: i64,
    pub nonce: String,
    pub key_id: String,
    pub body_sha256: String,
}

impl SigMeta {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("sig meta serializes");
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

pub fn canonical_string(
    method: &str,
    path_and_query: &str,
    body_sha256: &str,
    ts: i64,
    nonce: &str,
    key_id: &str,
) -> String {
    format!("{method}\n{path_and_query}\n{body_sha256}\n{ts}\n{nonce}\n{key_id}")
}

fn fresh_nonce() -> String {
    let mut buf = [0u8; 16];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// A signature plus its meta header, ready to attach to a request.
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    pub signature: String,
    pub meta: String,
}

/// Head-side signer.
pub struct EnvelopeSigner {
    signing: SigningKey,
    key_id: String,
}

impl EnvelopeSigner {
    pub fn new(keypair: &HeadKeypair) -> Self {
        Self {
            signing: keypair.signing.clone(),
            key_id: keypair.key_id.clone(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn sign(&self, method: &str, path_and_query: &str, body: &[u8]) -> SignedEnvelope {
        self.sign_at(
            method,
            path_and_query,
            body,
            Utc::now().timestamp(),
            &fresh_nonce(),
        )
    }

    /// Sign with an explicit timestamp and nonce. Production callers use
    /// [`EnvelopeSigner::sign`]; this entry point exists so tests can pin
    /// both values.
    pub fn sign_at(
        &self,
        method: &str,
        path_and_query: &str,
        body: &[u8],
        ts: i64,
        nonce: &str,
    ) -> SignedEnvelope {
        let meta = SigMeta {
            ts,
            nonce: nonce.to_string(),
            key_id: self.key_id.clone(),
            body_sha256: body_digest(body),
        };
        let canonical = canonical_string(
            method,
            path_and_query,
            &meta.body_sha256,
            meta.ts,
            &meta.nonce,
            &meta.key_id,
        );
        let signature = self.signing.sign(canonical.as_bytes());
        SignedEnvelope {
            signature: BASE64_STANDARD.encode(signature.to_bytes()),
            meta: meta.encode(),
        }
    }
}

/// Node-side verifier: trusted key ring plus the replay window.
pub struct EnvelopeVerifier {
    ring: Arc<KeyRing>,
    nonces: NonceWindow,
}

impl EnvelopeVerifier {
    pub fn new(ring: Arc<KeyRing>) -> Self {
        Self {
            ring,
            nonces: NonceWindow::default(),
        }
    }

    pub fn ring(&self) -> &KeyRing {
        &self.ring
    }

    /// Verify one request. The nonce is only recorded after the signature
    /// checks out, so unauthenticated traffic cannot poison the window.
    pub fn verify(
        &self,
        method: &str,
        path_and_query: &str,
        body: &[u8],
        signature_header: Option<&str>,
        meta_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AuthErrorKind> {
        let signature_b64 = signature_header.ok_or(AuthErrorKind::MissingEnvelope)?;
        let meta_raw = meta_header.ok_or(AuthErrorKind::MissingEnvelope)?;
        let meta = SigMeta::decode(meta_raw).ok_or(AuthErrorKind::MissingEnvelope)?;

        if meta.body_sha256 != body_digest(body) {
            return Err(AuthErrorKind::BadSignature);
        }
        if (now.timestamp() - meta.ts).abs() > MAX_CLOCK_SKEW_SECONDS {
            return Err(AuthErrorKind::Stale);
        }

        let key = self
            .ring
            .find(&meta.key_id)
            .ok_or(AuthErrorKind::UnknownKey)?;

        let signature_bytes = BASE64_STANDARD
            .decode(signature_b64.trim())
            .map_err(|_| AuthErrorKind::BadSignature)?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| AuthErrorKind::BadSignature)?;

        let canonical = canonical_string(
            method,
            path_and_query,
            &meta.body_sha256,
            meta.ts,
            &meta.nonce,
            &meta.key_id,
        );
        key.verifying
            .verify(canonical.as_bytes(), &signature)
            .map_err(|_| AuthErrorKind::BadSignature)?;

        if !self.nonces.observe(&meta.key_id, &meta.nonce, now) {
            return Err(AuthErrorKind::Replayed);
        }
        Ok(())
    }
}
