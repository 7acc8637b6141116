//! Validator identity and signing.
//!
//! Every validator is identified by a 20-byte address derived from its
//! secp256k1 public key. Round digests are signed with recoverable ECDSA so
//! a peer can recover the signer's address from the signature alone, which
//! is what the admission handshake and every signature round rely on.

use borsh::{BorshDeserialize, BorshSerialize};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 32-byte digest.
pub type Hash32 = [u8; 32];

/// Errors from key handling and signature recovery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid private key bytes")]
    InvalidPrivateKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("invalid address encoding")]
    InvalidAddress,
    #[error("signature recovery failed")]
    Recovery,
    #[error("signing failed")]
    Signing,
}

/// Compute the Keccak-256 digest of `data`.
pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A validator address: the trailing 20 bytes of the Keccak-256 digest of
/// the uncompressed public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Derive the address of a public key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);
        Address(address)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, KeyError> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|_| KeyError::InvalidAddress)?;
        let address: [u8; 20] = bytes.try_into().map_err(|_| KeyError::InvalidAddress)?;
        Ok(Address(address))
    }
}

/// A validator's signing key. Debug output is redacted.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generate a fresh key from the system RNG.
    pub fn random() -> Self {
        Self {
            key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        SigningKey::from_slice(bytes)
            .map(|key| Self { key })
            .map_err(|_| KeyError::InvalidPrivateKey)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|_| KeyError::InvalidPrivateKey)?;
        Self::from_bytes(&bytes)
    }

    /// The address other validators know this key by.
    pub fn address(&self) -> Address {
        Address::from_verifying_key(self.key.verifying_key())
    }

    /// Sign a 32-byte digest, producing a recoverable signature.
    pub fn sign_digest(&self, digest: &Hash32) -> Result<RecoverableSignature, KeyError> {
        let (signature, recovery) = self
            .key
            .sign_prehash_recoverable(digest)
            .map_err(|_| KeyError::Signing)?;
        Ok(RecoverableSignature::from_parts(&signature, recovery))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(<redacted>)")
    }
}

/// Recoverable ECDSA signature in `{r, s, v}` form; 65 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl RecoverableSignature {
    fn from_parts(signature: &Signature, recovery: RecoveryId) -> Self {
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Self {
            r,
            s,
            v: recovery.to_byte(),
        }
    }

    /// Raw 65-byte encoding: `r ∥ s ∥ v`.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.v;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 65 {
            return Err(KeyError::InvalidSignature);
        }
        if RecoveryId::from_byte(bytes[64]).is_none() {
            return Err(KeyError::InvalidSignature);
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Self { r, s, v: bytes[64] })
    }

    /// Recover the address that signed `digest`.
    pub fn recover_address(&self, digest: &Hash32) -> Result<Address, KeyError> {
        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(&self.r);
        raw[32..].copy_from_slice(&self.s);
        let signature = Signature::from_slice(&raw).map_err(|_| KeyError::InvalidSignature)?;
        let recovery = RecoveryId::from_byte(self.v).ok_or(KeyError::InvalidSignature)?;
        let key = VerifyingKey::recover_from_prehash(digest, &signature, recovery)
            .map_err(|_| KeyError::Recovery)?;
        Ok(Address::from_verifying_key(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_round_trip() {
        let key = PrivateKey::random();
        let digest = keccak256(b"round payload");
        let signature = key.sign_digest(&digest).unwrap();
        assert_eq!(signature.recover_address(&digest).unwrap(), key.address());
    }

    #[test]
    fn recovery_under_wrong_digest_does_not_yield_signer() {
        let key = PrivateKey::random();
        let digest = keccak256(b"round payload");
        let other = keccak256(b"a different payload");
        let signature = key.sign_digest(&digest).unwrap();
        match signature.recover_address(&other) {
            Ok(address) => assert_ne!(address, key.address()),
            Err(_) => {}
        }
    }

    #[test]
    fn signature_byte_round_trip() {
        let key = PrivateKey::random();
        let digest = keccak256(b"bytes");
        let signature = key.sign_digest(&digest).unwrap();
        let decoded = RecoverableSignature::from_bytes(&signature.to_bytes()).unwrap();
        assert_eq!(decoded, signature);
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert!(RecoverableSignature::from_bytes(&[0u8; 64]).is_err());
        let mut bad_recovery = [0u8; 65];
        bad_recovery[64] = 29;
        assert!(RecoverableSignature::from_bytes(&bad_recovery).is_err());
    }

    #[test]
    fn address_parses_from_display_form() {
        let address = PrivateKey::random().address();
        assert_eq!(address.to_string().parse::<Address>().unwrap(), address);
        assert!("0xnothex".parse::<Address>().is_err());
        assert!("0x0011".parse::<Address>().is_err());
    }

    #[test]
    fn distinct_keys_have_distinct_addresses() {
        assert_ne!(PrivateKey::random().address(), PrivateKey::random().address());
    }

    #[test]
    fn key_hex_round_trip() {
        let key = PrivateKey::random();
        let hex_form = hex::encode(key.key.to_bytes());
        let restored = PrivateKey::from_hex(&hex_form).unwrap();
        assert_eq!(restored.address(), key.address());
    }
}
