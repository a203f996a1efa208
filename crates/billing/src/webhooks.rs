//! Provider webhook verification and intake.
//!
//! The payment provider signs each delivery with an HMAC over
//! `"{timestamp}.{payload}"`, sent as a `t=...,v1=...` header. Verification
//! happens here, before anything reaches the reconciler; an event that
//! fails verification never touches the state machine.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events;
use crate::reconciler::{ReconcileOutcome, Reconciler};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery before it is rejected as a replay.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a provider signature header against the raw payload.
///
/// The header format is `t=<unix>,v1=<hex>`; the signed payload is
/// `"{t}.{payload}"` keyed with the endpoint secret (`whsec_` prefix
/// stripped when present).
pub fn verify_signature(
    secret: &str,
    payload: &str,
    signature_header: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1]),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::warn!("Missing v1 signature in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance window"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook intake: verify, parse, reconcile.
pub struct WebhookReceiver {
    secret: String,
    reconciler: Reconciler,
}

impl WebhookReceiver {
    pub fn new(secret: String, reconciler: Reconciler) -> Self {
        Self { secret, reconciler }
    }

    /// Handle one raw delivery. `SignatureInvalid` means the delivery was
    /// not authentic; `Unavailable` asks the provider to redeliver; every
    /// other outcome acknowledges the event.
    pub async fn receive(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<ReconcileOutcome> {
        verify_signature(
            &self.secret,
            payload,
            signature_header,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let envelope = match events::parse_event(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Authentic but malformed: acknowledge and drop, a replay
                // of the same bytes cannot parse differently.
                tracing::warn!(error = %e, "Dropping malformed provider event");
                return Ok(ReconcileOutcome::Skipped(e.to_string()));
            }
        };

        self.reconciler.process_event(&envelope).await
    }
}
