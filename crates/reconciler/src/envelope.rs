//! Inbound event envelope and signature verification
//!
//! The payment processor signs each delivery with a shared secret using the
//! `t=<unix>,v1=<hex hmac-sha256>` header scheme, where the signed content is
//! `"{t}.{raw body}"`. Verification happens before anything is parsed or
//! persisted; a delivery that fails here is rejected outright and never
//! reaches the idempotency ledger.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{ReconcileError, ReconcileResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between the signature timestamp and now.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// The opaque envelope every inbound event arrives in.
///
/// `payload` stays untyped here; the dispatcher validates it into the closed
/// event union before any reconciler sees it.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub external_event_id: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Parse a raw (already verified) delivery body.
    pub fn from_slice(body: &[u8]) -> ReconcileResult<Self> {
        serde_json::from_slice(body).map_err(|e| ReconcileError::MalformedEnvelope(e.to_string()))
    }
}

/// Verifies delivery signatures against the shared webhook secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify a signature header against the raw delivery body.
    pub fn verify(&self, body: &[u8], signature: &str) -> ReconcileResult<()> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!(error = %e, "System time error during signature verification");
                ReconcileError::SignatureInvalid
            })?
            .as_secs() as i64;

        self.verify_at(body, signature, now)
    }

    /// Verification with an explicit clock, split out so the tolerance window
    /// is testable.
    fn verify_at(&self, body: &[u8], signature: &str, now: i64) -> ReconcileResult<()> {
        // Parse the signature header: t=timestamp,v1=signature
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            ReconcileError::SignatureInvalid
        })?;

        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::warn!("Missing v1 signature in signature header");
            ReconcileError::SignatureInvalid
        })?;

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance window"
            );
            return Err(ReconcileError::SignatureInvalid);
        }

        let computed = self.compute(body, timestamp)?;

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(ReconcileError::SignatureInvalid);
        }

        Ok(())
    }

    /// Produce a `t=..,v1=..` header for a body at the given timestamp.
    ///
    /// Used by tests and by local delivery tooling; production signatures
    /// come from the processor.
    pub fn sign(&self, body: &[u8], timestamp: i64) -> ReconcileResult<String> {
        let sig = self.compute(body, timestamp)?;
        Ok(format!("t={},v1={}", timestamp, sig))
    }

    fn compute(&self, body: &[u8], timestamp: i64) -> ReconcileResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            ReconcileError::SignatureInvalid
        })?;
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
