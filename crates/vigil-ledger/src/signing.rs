//! Ed25519 signing primitives shared by signers and witnesses.
//!
//! The registry (`keyring` module) only ever stores *public* key material;
//! private keys live in whatever holds a [`KeypairSigner`], kept entirely
//! out of the ledger's persistence boundary.

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer as DalekSigner, Verifier};
use rand::RngCore;
use vigil_types::{KeyId, VigilError, VigilResult};

/// Behaviour required of anything that can sign on behalf of a registered
/// key (§4.C step 4, §4.E).
pub trait Signer: Send + Sync {
    /// The `key_id` this signer's signatures should be verified against.
    fn key_id(&self) -> &KeyId;

    /// Sign `message`, returning the raw signature bytes.
    fn sign(&self, message: &[u8]) -> VigilResult<Vec<u8>>;

    /// The 32-byte public key corresponding to this signer.
    fn public_key(&self) -> [u8; 32];
}

/// An in-process Ed25519 signer. Production deployments would back this
/// with an out-of-process HSM or KMS call (§5: "signing may be
/// out-of-process"); this type is the reference implementation used by
/// tests and single-process deployments.
pub struct KeypairSigner {
    key_id: KeyId,
    keypair: Keypair,
}

impl KeypairSigner {
    /// Generate a fresh signer for `key_id` using the OS random source.
    pub fn generate(key_id: impl Into<KeyId>) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let secret = SecretKey::from_bytes(&seed).expect("32-byte seed is always valid");
        let public = PublicKey::from(&secret);
        Self {
            key_id: key_id.into(),
            keypair: Keypair { secret, public },
        }
    }

    /// Reconstruct a signer from a raw 32-byte secret seed.
    pub fn from_seed(key_id: impl Into<KeyId>, seed: &[u8; 32]) -> VigilResult<Self> {
        let secret = SecretKey::from_bytes(seed)
            .map_err(|e| VigilError::Validation(format!("invalid ed25519 seed: {e}")))?;
        let public = PublicKey::from(&secret);
        Ok(Self {
            key_id: key_id.into(),
            keypair: Keypair { secret, public },
        })
    }
}

impl Signer for KeypairSigner {
    fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    fn sign(&self, message: &[u8]) -> VigilResult<Vec<u8>> {
        Ok(self.keypair.sign(message).to_bytes().to_vec())
    }

    fn public_key(&self) -> [u8; 32] {
        self.keypair.public.to_bytes()
    }
}

/// Verify `signature` over `message` against the 32-byte Ed25519 public
/// key `public_key`.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> VigilResult<()> {
    let pk = PublicKey::from_bytes(public_key)
        .map_err(|e| VigilError::Validation(format!("invalid public key: {e}")))?;
    let sig = Signature::from_bytes(signature)
        .map_err(|e| VigilError::Validation(format!("invalid signature encoding: {e}")))?;
    pk.verify(message, &sig)
        .map_err(|e| VigilError::HashMismatch(format!("signature verification failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let signer = KeypairSigner::generate("k1");
        let msg = b"content-hash-bytes";
        let sig = signer.sign(msg).unwrap();
        verify_signature(&signer.public_key(), msg, &sig).unwrap();
    }

    #[test]
    fn tampered_signature_fails() {
        let signer = KeypairSigner::generate("k1");
        let msg = b"content-hash-bytes";
        let mut sig = signer.sign(msg).unwrap();
        sig[0] ^= 0xFF;
        assert!(verify_signature(&signer.public_key(), msg, &sig).is_err());
    }
}
