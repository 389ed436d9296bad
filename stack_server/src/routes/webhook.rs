//! Signup webhook: the signup flow posts a signed event once a customer has paid
//! or started a trial.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::models::TenantConfig;
use crate::service::{Accepted, ProvisioningService};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature-256";

#[derive(Debug, Deserialize)]
pub struct SignupEvent {
    pub event: String,
    pub tenant: TenantConfig,
}

/// Validate an `X-Signature-256: sha256=<hex>` header against the raw body.
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(sig_bytes) = hex::decode(sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Returns `None` for events that do not start provisioning.
pub async fn handle_signup(
    service: &ProvisioningService,
    secret: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Option<Accepted>, StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !validate_signature(secret, &body, signature) {
        tracing::warn!("Signup webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event: SignupEvent = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(error = %e, "malformed signup event");
        StatusCode::BAD_REQUEST
    })?;

    if event.event != "signup.completed" {
        tracing::debug!(event = %event.event, "Ignoring webhook event");
        return Ok(None);
    }

    crate::metrics::signup_received("webhook");
    let tenant_id = event.tenant.tenant_id.clone();
    match service.spawn_provision(event.tenant).await {
        Ok(accepted) => {
            tracing::info!(%tenant_id, status = %accepted.status, "provisioning triggered by signup");
            Ok(Some(accepted))
        }
        Err(e) => {
            tracing::warn!(%tenant_id, error = %e, "signup did not start provisioning");
            Err(super::status_for(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"event":"signup.completed"}"#;
        assert!(validate_signature("s3cret", body, &sign("s3cret", body)));
    }

    #[test]
    fn tampered_body_or_wrong_secret_is_rejected() {
        let body = br#"{"event":"signup.completed"}"#;
        let sig = sign("s3cret", body);
        assert!(!validate_signature("s3cret", br#"{"event":"other"}"#, &sig));
        assert!(!validate_signature("other", body, &sig));
        assert!(!validate_signature("s3cret", body, "sha256=not-hex"));
        assert!(!validate_signature("s3cret", body, ""));
    }

    #[test]
    fn empty_secret_skips_validation() {
        assert!(validate_signature("", b"anything", ""));
    }
}
