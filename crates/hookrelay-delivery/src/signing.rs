//! Outbound request signing.
//!
//! Produces one signature value per active signature version so receivers
//! can rotate verification keys with zero downtime. The header grammar is
//! `t=<unix-seconds>,v1=<sig1>[,v2=<sig2>...]`; the canonical signed bytes
//! are `"{timestamp}.{raw_body}"`. Signing is deterministic: identical
//! (timestamp, body, secret) always yields an identical header.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

use hookrelay_core::models::{EndpointSecret, HashFn, SigEncoding, SignatureConfig};

use crate::error::{DeliveryError, Result};

/// How long an expired secret keeps signing after `expires_at`.
///
/// The grace window lets receivers finish rolling to the replacement secret
/// before old signatures disappear from the header.
pub const SECRET_EXPIRY_GRACE: Duration = Duration::hours(1);

/// Computes one signature over the canonical bytes.
///
/// # Errors
///
/// Returns `Configuration` when the secret is empty.
pub fn compute_signature(
    hash: HashFn,
    encoding: SigEncoding,
    secret: &str,
    timestamp: i64,
    body: &str,
) -> Result<String> {
    if secret.is_empty() {
        return Err(DeliveryError::configuration("signing secret is empty"));
    }

    let payload = format!("{timestamp}.{body}");
    let digest: Vec<u8> = match hash {
        HashFn::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .map_err(|e| DeliveryError::configuration(format!("invalid hmac key: {e}")))?;
            mac.update(payload.as_bytes());
            mac.finalize().into_bytes().to_vec()
        },
        HashFn::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
                .map_err(|e| DeliveryError::configuration(format!("invalid hmac key: {e}")))?;
            mac.update(payload.as_bytes());
            mac.finalize().into_bytes().to_vec()
        },
    };

    Ok(match encoding {
        SigEncoding::Hex => hex::encode(digest),
        SigEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(digest),
    })
}

/// Builds the full signature header value for an outbound request.
///
/// Every version signs with every usable secret, in declaration order, so
/// `v1` repeats when several secrets are active mid-rotation.
///
/// # Errors
///
/// Returns `Configuration` when no version or no usable secret exists.
pub fn build_signature_header(
    config: &SignatureConfig,
    secrets: &[EndpointSecret],
    now: DateTime<Utc>,
    body: &str,
) -> Result<String> {
    if config.versions.is_empty() {
        return Err(DeliveryError::configuration("no active signature versions"));
    }

    let usable: Vec<&EndpointSecret> =
        secrets.iter().filter(|s| s.is_usable(now, SECRET_EXPIRY_GRACE)).collect();
    if usable.is_empty() {
        return Err(DeliveryError::configuration("no usable signing secrets"));
    }

    let timestamp = now.timestamp();
    let mut parts = vec![format!("t={timestamp}")];
    for (index, version) in config.versions.iter().enumerate() {
        for secret in &usable {
            let signature =
                compute_signature(version.hash, version.encoding, &secret.value, timestamp, body)?;
            parts.push(format!("v{}={signature}", index + 1));
        }
    }

    Ok(parts.join(","))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use uuid::Uuid;

    use hookrelay_core::models::SignatureVersion;

    use super::*;

    fn secret(value: &str, expires_at: Option<DateTime<Utc>>) -> EndpointSecret {
        EndpointSecret {
            uid: Uuid::new_v4(),
            value: value.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            expires_at,
        }
    }

    fn version(hash: HashFn, encoding: SigEncoding) -> SignatureVersion {
        SignatureVersion { uid: Uuid::new_v4(), hash, encoding, created_at: Utc::now() }
    }

    fn config(versions: Vec<SignatureVersion>) -> SignatureConfig {
        SignatureConfig { header: "X-Hookrelay-Signature".to_string(), versions }
    }

    #[test]
    fn signing_is_deterministic() {
        let a = compute_signature(HashFn::Sha256, SigEncoding::Hex, "sec", 1700000000, "{}")
            .unwrap();
        let b = compute_signature(HashFn::Sha256, SigEncoding::Hex, "sec", 1700000000, "{}")
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn signature_depends_on_timestamp_and_body() {
        let base =
            compute_signature(HashFn::Sha256, SigEncoding::Hex, "sec", 1700000000, "{}").unwrap();
        let other_ts =
            compute_signature(HashFn::Sha256, SigEncoding::Hex, "sec", 1700000001, "{}").unwrap();
        let other_body =
            compute_signature(HashFn::Sha256, SigEncoding::Hex, "sec", 1700000000, "{+}").unwrap();
        assert_ne!(base, other_ts);
        assert_ne!(base, other_body);
    }

    #[test]
    fn header_follows_grammar() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let config = config(vec![version(HashFn::Sha256, SigEncoding::Hex)]);
        let header =
            build_signature_header(&config, &[secret("sec", None)], now, r#"{"id":42}"#).unwrap();

        let timestamp = now.timestamp();
        assert!(header.starts_with(&format!("t={timestamp},v1=")));
        assert_eq!(header.split(',').count(), 2);
    }

    #[test]
    fn each_version_contributes_a_signature() {
        let now = Utc::now();
        let config = config(vec![
            version(HashFn::Sha256, SigEncoding::Hex),
            version(HashFn::Sha512, SigEncoding::Base64),
        ]);
        let header = build_signature_header(&config, &[secret("sec", None)], now, "{}").unwrap();

        assert!(header.contains(",v1="));
        assert!(header.contains(",v2="));
        let v1 = header.split(",v1=").nth(1).unwrap().split(',').next().unwrap();
        let v2 = header.split(",v2=").nth(1).unwrap();
        assert_ne!(v1, v2);
    }

    #[test]
    fn rotating_secrets_both_sign_inside_grace() {
        let now = Utc::now();
        let config = config(vec![version(HashFn::Sha256, SigEncoding::Hex)]);
        let secrets = vec![
            secret("old", Some(now - Duration::minutes(10))), // inside the 1h grace
            secret("new", None),
        ];
        let header = build_signature_header(&config, &secrets, now, "{}").unwrap();
        assert_eq!(header.matches("v1=").count(), 2);
    }

    #[test]
    fn long_expired_secrets_stop_signing() {
        let now = Utc::now();
        let config = config(vec![version(HashFn::Sha256, SigEncoding::Hex)]);
        let secrets = vec![secret("old", Some(now - Duration::hours(5))), secret("new", None)];
        let header = build_signature_header(&config, &secrets, now, "{}").unwrap();
        assert_eq!(header.matches("v1=").count(), 1);
    }

    #[test]
    fn missing_secrets_or_versions_fail() {
        let now = Utc::now();
        assert!(build_signature_header(&config(vec![]), &[secret("s", None)], now, "{}").is_err());
        let config = config(vec![version(HashFn::Sha256, SigEncoding::Hex)]);
        assert!(build_signature_header(&config, &[], now, "{}").is_err());
    }

    #[test]
    fn encodings_differ_for_same_input() {
        let hex = compute_signature(HashFn::Sha256, SigEncoding::Hex, "s", 1, "{}").unwrap();
        let b64 = compute_signature(HashFn::Sha256, SigEncoding::Base64, "s", 1, "{}").unwrap();
        assert_ne!(hex, b64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
