//! Detached payload signatures.
//!
//! Signed payloads travel with two opaque strings: `X-Payload-Nonce` (hex) and
//! `X-Payload-Signature` (base64 HMAC-SHA256 over `nonce || payload`). The same
//! scheme signs outgoing webhooks, internal service calls and exported
//! tracker content.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Payload-Signature";
pub const NONCE_HEADER: &str = "X-Payload-Nonce";

const NONCE_BYTES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub nonce: String,
    pub signature: String,
}

/// Signs and verifies payloads on behalf of this service.
pub trait PayloadSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> SignedPayload;

    /// Returns false for malformed inputs as well as for mismatches.
    fn verify(&self, payload: &[u8], nonce: &str, signature: &str) -> bool;
}

/// HMAC-SHA256 signer keyed by the service's internal key.
#[derive(Clone)]
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    fn mac(&self, nonce: &[u8], payload: &[u8]) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("hmac key length is unrestricted"));
        mac.update(nonce);
        mac.update(payload);
        mac
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").finish_non_exhaustive()
    }
}

impl PayloadSigner for HmacSigner {
    fn sign(&self, payload: &[u8]) -> SignedPayload {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce = hex::encode(nonce);
        let tag = self.mac(nonce.as_bytes(), payload).finalize().into_bytes();
        SignedPayload {
            nonce,
            signature: STANDARD.encode(tag),
        }
    }

    fn verify(&self, payload: &[u8], nonce: &str, signature: &str) -> bool {
        let Ok(expected) = STANDARD.decode(signature) else {
            return false;
        };
        if hex::decode(nonce).is_err() {
            return false;
        }
        self.mac(nonce.as_bytes(), payload)
            .verify_slice(&expected)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> HmacSigner {
        HmacSigner::new(b"0123456789abcdef0123456789abcdef")
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = signer();
        let signed = signer.sign(b"{\"subject\":\"hi\"}");
        assert_eq!(signed.nonce.len(), NONCE_BYTES * 2);
        assert!(signer.verify(b"{\"subject\":\"hi\"}", &signed.nonce, &signed.signature));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let signer = signer();
        let signed = signer.sign(b"{\"subject\":\"hi\"}");
        assert!(!signer.verify(b"{\"subject\":\"ho\"}", &signed.nonce, &signed.signature));
    }

    #[test]
    fn test_other_key_fails() {
        let signed = signer().sign(b"payload");
        let other = HmacSigner::new(b"another key entirely");
        assert!(!other.verify(b"payload", &signed.nonce, &signed.signature));
    }

    #[test]
    fn test_malformed_inputs_fail() {
        let signer = signer();
        let signed = signer.sign(b"payload");
        assert!(!signer.verify(b"payload", "not-hex", &signed.signature));
        assert!(!signer.verify(b"payload", &signed.nonce, "***"));
    }

    #[test]
    fn test_nonces_differ() {
        let signer = signer();
        assert_ne!(signer.sign(b"x").nonce, signer.sign(b"x").nonce);
    }
}
