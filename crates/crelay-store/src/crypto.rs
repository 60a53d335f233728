use aws_lc_rs::aead::{Aad, Nonce, RandomizedNonceKey, AES_256_GCM, NONCE_LEN};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crelay_common::{RelayError, RelayResult};

/// Stored form of an encrypted OAuth blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
    pub iv: String,
}

/// AES-256-GCM with a process-wide key. The nonce is generated per seal and
/// persisted alongside the ciphertext as `iv`.
pub struct Cipher {
    key: RandomizedNonceKey,
}

impl Cipher {
    pub fn new(key: &[u8; 32]) -> RelayResult<Self> {
        let key = RandomizedNonceKey::new(&AES_256_GCM, key)
            .map_err(|_| RelayError::Crypto("invalid encryption key".into()))?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> RelayResult<Envelope> {
        let mut in_out = plaintext.to_vec();
        let nonce = self
            .key
            .seal_in_place_append_tag(Aad::empty(), &mut in_out)
            .map_err(|_| RelayError::Crypto("seal failed".into()))?;
        Ok(Envelope {
            ciphertext: BASE64.encode(&in_out),
            iv: BASE64.encode(nonce.as_ref()),
        })
    }

    pub fn decrypt(&self, envelope: &Envelope) -> RelayResult<Vec<u8>> {
        let iv = BASE64
            .decode(&envelope.iv)
            .map_err(|_| RelayError::Crypto("iv is not base64".into()))?;
        if iv.len() != NONCE_LEN {
            return Err(RelayError::Crypto("iv has wrong length".into()));
        }
        let mut in_out = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|_| RelayError::Crypto("ciphertext is not base64".into()))?;
        let nonce = Nonce::try_assume_unique_for_key(&iv)
            .map_err(|_| RelayError::Crypto("iv rejected".into()))?;
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| RelayError::Crypto("open failed".into()))?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(byte: u8) -> Cipher {
        Cipher::new(&[byte; 32]).unwrap()
    }

    #[test]
    fn round_trips_arbitrary_bytes() {
        let c = cipher(7);
        for payload in [&b""[..], b"{\"access_token\":\"tok\"}", &[0u8, 255, 1, 254]] {
            let sealed = c.encrypt(payload).unwrap();
            assert_eq!(c.decrypt(&sealed).unwrap(), payload);
        }
    }

    #[test]
    fn nonces_differ_between_seals() {
        let c = cipher(7);
        let a = c.encrypt(b"same").unwrap();
        let b = c.encrypt(b"same").unwrap();
        assert_ne!(a.iv, b.iv);
    }

    #[test]
    fn wrong_key_errors_instead_of_garbage() {
        let sealed = cipher(1).encrypt(b"secret").unwrap();
        assert!(matches!(
            cipher(2).decrypt(&sealed),
            Err(RelayError::Crypto(_))
        ));
    }

    #[test]
    fn mangled_ciphertext_is_rejected() {
        let c = cipher(9);
        let mut sealed = c.encrypt(b"secret").unwrap();
        sealed.ciphertext = BASE64.encode(b"not a real ciphertext");
        assert!(matches!(c.decrypt(&sealed), Err(RelayError::Crypto(_))));
    }
}
