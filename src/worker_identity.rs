//! Node identity and signing for proofs of compute.
//!
//! Grounded in `examples/original_source/src/worker_identity.h`: an Ed25519
//! keypair, a worker id that is the base64 of the raw 32-byte public key,
//! and `sign`/`verify` over arbitrary byte strings — here, the canonical
//! proof serialization (spec §6).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// A node's signing identity. The public half, base64-encoded, is the
/// node/worker id used throughout the proof and consensus wire format.
pub struct WorkerIdentity {
    signing_key: SigningKey,
}

impl WorkerIdentity {
    /// Generate a fresh Ed25519 keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Load an identity from a raw 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// The worker id: base64 of the raw 32-byte public key (spec §6).
    pub fn worker_id(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign `data`, returning a base64-encoded signature.
    pub fn sign(&self, data: &[u8]) -> String {
        let signature = self.signing_key.sign(data);
        BASE64.encode(signature.to_bytes())
    }

    /// Verify a base64-encoded signature against a base64-encoded (worker id)
    /// public key.
    pub fn verify(data: &[u8], signature_b64: &str, worker_id: &str) -> bool {
        let Ok(pub_bytes) = BASE64.decode(worker_id) else {
            return false;
        };
        let Ok(pub_bytes): Result<[u8; 32], _> = pub_bytes.try_into() else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&pub_bytes) else {
            return false;
        };

        let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
            return false;
        };
        let Ok(sig_bytes): Result<[u8; 64], _> = sig_bytes.try_into() else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key.verify(data, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let identity = WorkerIdentity::generate();
        let data = b"canonical proof bytes";
        let signature = identity.sign(data);
        assert!(WorkerIdentity::verify(data, &signature, &identity.worker_id()));
    }

    #[test]
    fn verify_rejects_tampered_data() {
        let identity = WorkerIdentity::generate();
        let signature = identity.sign(b"original");
        assert!(!WorkerIdentity::verify(b"tampered", &signature, &identity.worker_id()));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let a = WorkerIdentity::generate();
        let b = WorkerIdentity::generate();
        let signature = a.sign(b"data");
        assert!(!WorkerIdentity::verify(b"data", &signature, &b.worker_id()));
    }
}
