//! Billing provider webhooks.
//!
//! Payloads are authenticated by an HMAC-SHA256 signature over
//! `"{timestamp}.{body}"` carried in the `Stripe-Signature` header
//! (`t=<unix>,v1=<hex>[,v1=<hex>...]`). These requests never pass through
//! subject authentication or the rate limiter.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::{
    error::{GatewayError, GatewayResult},
    identity::Plan,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub struct StripeSignatureVerifier {
    secret: Vec<u8>,
    tolerance_secs: u64,
}

impl StripeSignatureVerifier {
    pub fn new(secret: &str, tolerance_secs: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, header: &str, payload: &[u8], now_secs: i64) -> GatewayResult<()> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for item in header.split(',') {
            match item.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => {
                    if let Ok(sig) = hex::decode(value) {
                        signatures.push(sig);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(GatewayError::Unauthenticated)?;
        if signatures.is_empty() {
            return Err(GatewayError::Unauthenticated);
        }
        if now_secs.abs_diff(timestamp) > self.tolerance_secs {
            tracing::warn!(timestamp, now_secs, "webhook signature outside tolerance");
            return Err(GatewayError::InvalidCredential);
        }

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        // verify_slice compares in constant time
        if signatures
            .iter()
            .any(|sig| mac.clone().verify_slice(sig).is_ok())
        {
            Ok(())
        } else {
            Err(GatewayError::InvalidCredential)
        }
    }

    #[cfg(test)]
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }
}

#[derive(Debug, Deserialize)]
pub struct BillingEvent {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: BillingEventData,
}

#[derive(Debug, Default, Deserialize)]
pub struct BillingEventData {
    #[serde(default)]
    pub object: Value,
}

/// A plan change carried by a subscription event, keyed by account email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanChange {
    pub email: String,
    pub plan: Plan,
}

impl BillingEvent {
    pub fn plan_change(&self) -> Option<PlanChange> {
        let metadata = self.data.object.get("metadata")?;
        let email = metadata.get("email")?.as_str()?.to_string();

        let plan = match self.kind.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                metadata.get("plan")?.as_str()?.parse().ok()?
            }
            "customer.subscription.deleted" => Plan::Free,
            _ => return None,
        };

        Some(PlanChange { email, plan })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn verifier() -> StripeSignatureVerifier {
        StripeSignatureVerifier::new("whsec_test", 300)
    }

    #[test]
    fn accepts_valid_signature() {
        let v = verifier();
        let payload = br#"{"type":"invoice.paid"}"#;
        let header = v.sign(payload, NOW - 10);
        v.verify(&header, payload, NOW).unwrap();
    }

    #[test]
    fn rejects_tampered_payload_and_stale_timestamp() {
        let v = verifier();
        let header = v.sign(b"original", NOW);
        assert!(matches!(
            v.verify(&header, b"tampered", NOW),
            Err(GatewayError::InvalidCredential)
        ));

        let stale = v.sign(b"original", NOW - 301);
        assert!(matches!(
            v.verify(&stale, b"original", NOW),
            Err(GatewayError::InvalidCredential)
        ));

        let other = StripeSignatureVerifier::new("whsec_other", 300).sign(b"original", NOW);
        assert!(v.verify(&other, b"original", NOW).is_err());
    }

    #[test]
    fn rejects_malformed_header() {
        let v = verifier();
        assert!(matches!(v.verify("", b"x", NOW), Err(GatewayError::Unauthenticated)));
        assert!(matches!(
            v.verify(&format!("t={NOW}"), b"x", NOW),
            Err(GatewayError::Unauthenticated)
        ));
    }

    #[test]
    fn extracts_plan_changes() {
        let updated: BillingEvent = serde_json::from_value(json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "data": { "object": { "metadata": { "email": "a@example.com", "plan": "pro" } } }
        }))
        .unwrap();
        assert_eq!(
            updated.plan_change(),
            Some(PlanChange {
                email: "a@example.com".to_string(),
                plan: Plan::Pro
            })
        );

        let deleted: BillingEvent = serde_json::from_value(json!({
            "type": "customer.subscription.deleted",
            "data": { "object": { "metadata": { "email": "a@example.com" } } }
        }))
        .unwrap();
        assert_eq!(deleted.plan_change().unwrap().plan, Plan::Free);

        let other: BillingEvent =
            serde_json::from_value(json!({ "type": "invoice.paid" })).unwrap();
        assert!(other.plan_change().is_none());
    }
}
