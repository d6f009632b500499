use blake3::Hasher;
use pqcrypto_dilithium::dilithium3::{
    detached_sign, keypair, verify_detached_signature, DetachedSignature, PublicKey, SecretKey,
};
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MultisigError;

// Sizes of the post-quantum signature primitives, used by the fee model.
pub const DILITHIUM3_PK_BYTES: usize = pqcrypto_dilithium::ffi::PQCLEAN_DILITHIUM3_CLEAN_CRYPTO_PUBLICKEYBYTES;
pub const DILITHIUM3_SIG_BYTES: usize = pqcrypto_dilithium::ffi::PQCLEAN_DILITHIUM3_CLEAN_CRYPTO_BYTES;

// Derive-key contexts. Each hashed structure gets its own domain.
pub const CTX_PKH: &str = "nockvault-pkh";
pub const CTX_LOCK: &str = "nockvault-lock-root";
pub const CTX_NOTE: &str = "nockvault-note";
pub const CTX_TX_ID: &str = "nockvault-tx-id";
pub const CTX_SIG_HASH: &str = "nockvault-sig-hash";
pub const CTX_OUTPUT: &str = "nockvault-output-name";
const CTX_GENERIC: &str = "nockvault-v1";

/// A 32-byte BLAKE3 digest. Renders and parses as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

/// Public-key hash identifying a single signer.
pub type Pkh = Digest;

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = MultisigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| MultisigError::InvalidInput(format!("invalid hex digest '{s}': {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MultisigError::InvalidInput(format!("digest '{s}' must be 32 bytes")))?;
        Ok(Digest(arr))
    }
}

/// Hashes `data` under the given derive-key context.
pub fn hash_with(context: &str, data: &[u8]) -> Digest {
    Digest(*Hasher::new_derive_key(context).update(data).finalize().as_bytes())
}

/// Hashes arbitrary data with the crate-wide default domain.
pub fn blake3_hash(data: &[u8]) -> Digest {
    hash_with(CTX_GENERIC, data)
}

pub fn pkh_from_bytes(pk: &[u8]) -> Pkh {
    hash_with(CTX_PKH, pk)
}

pub fn pkh_from_pk(pk: &PublicKey) -> Pkh {
    pkh_from_bytes(pk.as_bytes())
}

pub fn dilithium3_keypair() -> (PublicKey, SecretKey) {
    keypair()
}

/// Detached Dilithium3 signature over a digest.
pub fn sign_digest(sk: &SecretKey, msg: &Digest) -> Vec<u8> {
    detached_sign(msg.as_bytes(), sk).as_bytes().to_vec()
}

/// Verifies a detached signature given raw key and signature bytes.
/// Malformed bytes verify as false.
pub fn verify_digest(pk: &[u8], sig: &[u8], msg: &Digest) -> bool {
    let Ok(pk) = PublicKey::from_bytes(pk) else { return false };
    let Ok(sig) = DetachedSignature::from_bytes(sig) else { return false };
    verify_detached_signature(&sig, msg.as_bytes(), &pk).is_ok()
}

/// Number of 8-byte words needed to hold `len` bytes.
pub const fn words(len: usize) -> u64 {
    ((len + 7) / 8) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_hex_roundtrip() {
        let d = blake3_hash(b"abc");
        let parsed: Digest = d.to_hex().parse().unwrap();
        assert_eq!(parsed, d);
        assert!("zz".parse::<Digest>().is_err());
        assert!("abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn contexts_separate_domains() {
        assert_ne!(hash_with(CTX_PKH, b"x"), hash_with(CTX_LOCK, b"x"));
    }

    #[test]
    fn sign_and_verify() {
        let (pk, sk) = dilithium3_keypair();
        let msg = blake3_hash(b"spend");
        let sig = sign_digest(&sk, &msg);
        assert!(verify_digest(pk.as_bytes(), &sig, &msg));
        assert!(!verify_digest(pk.as_bytes(), &sig, &blake3_hash(b"other")));
        assert!(!verify_digest(b"short", &sig, &msg));
    }

    #[test]
    fn word_rounding() {
        assert_eq!(words(0), 0);
        assert_eq!(words(1), 1);
        assert_eq!(words(8), 1);
        assert_eq!(words(9), 2);
    }
}
