//! Request signing for the account API.
//!
//! Every signed call carries the base64-encoded JSON payload both as the
//! request body and in a header, together with an HMAC-SHA384 of that
//! payload keyed by the account secret. The nonce and the request path are
//! part of the signed payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha384;

use crate::config::Credentials;
use crate::error::{MarlinError, Result};

type HmacSha384 = Hmac<Sha384>;

/// A fully signed account request, ready to POST.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// API endpoint relative to the configured prefix, e.g. `order/new`.
    pub endpoint: String,
    /// Base64 of the canonical JSON payload (body and header value).
    pub payload: String,
    /// Hex HMAC-SHA384 of `payload`.
    pub signature: String,
    /// The account API key.
    pub api_key: String,
}

/// Hex HMAC-SHA384 of `payload` keyed by `secret`. Also used for the
/// streaming account-channel handshake (`AUTH<nonce>` payload).
pub fn hmac_sha384_hex(secret: &str, payload: &str) -> Result<String> {
    let mut mac = HmacSha384::new_from_slice(secret.as_bytes())
        .map_err(|e| MarlinError::Signing(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Sign one account request.
///
/// `params` is extended with the `nonce` and the versioned `request` path
/// before serialization, so retried calls must be re-signed with a fresh
/// nonce.
pub fn sign(
    creds: &Credentials,
    endpoint: &str,
    mut params: Map<String, Value>,
    nonce: u64,
) -> Result<SignedRequest> {
    params.insert("nonce".to_string(), Value::String(nonce.to_string()));
    params.insert(
        "request".to_string(),
        Value::String(format!("/v1/{endpoint}")),
    );

    let payload = BASE64.encode(serde_json::to_string(&params)?);
    let signature = hmac_sha384_hex(&creds.secret, &payload)?;

    Ok(SignedRequest {
        endpoint: endpoint.to_string(),
        payload,
        signature,
        api_key: creds.key.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            key: "apikey".to_string(),
            secret: "topsecret".to_string(),
        }
    }

    #[test]
    fn sign_produces_known_payload_and_signature() {
        // Known-answer vector, independently computed.
        let signed = sign(&creds(), "balances", Map::new(), 12345).unwrap();
        assert_eq!(
            signed.payload,
            "eyJub25jZSI6IjEyMzQ1IiwicmVxdWVzdCI6Ii92MS9iYWxhbmNlcyJ9"
        );
        assert_eq!(
            signed.signature,
            "92b78fa9096bbedbda31f2cce0b12d1ba687ed8c8c55cc1bc72e8b70221b53a4dad2501ab134e868ca78034a5831d93d"
        );
        assert_eq!(signed.api_key, "apikey");
    }

    #[test]
    fn signed_payload_embeds_nonce_and_request_path() {
        let signed = sign(&creds(), "order/new", Map::new(), 42).unwrap();
        let decoded = BASE64.decode(&signed.payload).unwrap();
        let value: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["nonce"], "42");
        assert_eq!(value["request"], "/v1/order/new");
    }

    #[test]
    fn different_nonce_changes_signature() {
        let a = sign(&creds(), "balances", Map::new(), 1).unwrap();
        let b = sign(&creds(), "balances", Map::new(), 2).unwrap();
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn auth_handshake_vector() {
        assert_eq!(
            hmac_sha384_hex("secret", "AUTH1234567890").unwrap(),
            "9fa6b1bd5663a029d6d9b28b9af0998bfbef1c29a6378f744c4d73541939e557eb3f3cedd0958bec7ea16afa86398703"
        );
    }
}
