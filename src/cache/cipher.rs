//! Passphrase based authenticated encryption for cache payloads.
//!
//! - PBKDF2-HMAC-SHA256, 100 000 iterations, 256-bit output
//! - AES-256-GCM with a fresh random 96-bit IV per call
//!
//! Blobs come in two flavours. Blobs written in fixed-salt mode carry no
//! salt and derive their key from [`FIXED_SALT`]; blobs written in
//! per-blob mode carry a random 16-byte salt. Decryption picks the mode from
//! the presence of the salt, so both remain readable whatever mode new
//! writes use.

use std::sync::{Mutex, OnceLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::codec;
use super::envelope::EncryptedBlob;
use crate::error::{CacheError, CacheResult};

/// PBKDF2 iteration count.
pub const KDF_ITERATIONS: u32 = 100_000;
/// AES-GCM IV length in bytes.
pub const IV_LEN: usize = 12;
/// Per-blob salt length in bytes.
pub const SALT_LEN: usize = 16;
/// Salt for blobs that do not carry their own.
pub const FIXED_SALT: &[u8] = "固定盐值".as_bytes();

/// How new blobs get their key-derivation salt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaltMode {
  /// Constant salt; the blob does not carry one.
  Fixed,
  /// Random salt stored inside the blob.
  #[default]
  PerBlob,
}

/// 256-bit AES key, wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; 32]);

impl DerivedKey {
  #[must_use]
  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }
}

/// Derive an AES-256 key from a passphrase and salt.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> DerivedKey {
  let mut key = [0u8; 32];
  pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ITERATIONS, &mut key);
  DerivedKey(key)
}

/// Encrypts and decrypts JSON-serializable values under one passphrase.
pub struct Cipher {
  passphrase: Zeroizing<String>,
  salt_mode: SaltMode,
  /// Key for [`FIXED_SALT`], derived on first use.
  fixed_key: OnceLock<DerivedKey>,
  /// Last per-blob salt seen by `decrypt` and its key. Chunks of one write
  /// share a salt.
  salted_key: Mutex<Option<([u8; SALT_LEN], DerivedKey)>>,
}

enum SealKey<'a> {
  Shared(&'a DerivedKey),
  Owned(DerivedKey),
}

/// One key derivation reused for a run of blobs; every blob still gets a
/// fresh IV.
pub struct Sealer<'a> {
  key: SealKey<'a>,
  salt: Option<[u8; SALT_LEN]>,
}

impl Sealer<'_> {
  /// Serialize `value` to JSON and seal it under a fresh IV.
  pub fn encrypt<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<EncryptedBlob> {
    let plaintext = Zeroizing::new(serde_json::to_vec(value).map_err(CacheError::format)?);

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let key = match &self.key {
      SealKey::Shared(key) => *key,
      SealKey::Owned(key) => key,
    };
    let ciphertext = seal(key, &iv, &plaintext)?;

    Ok(EncryptedBlob {
      iv,
      salt: self.salt,
      data: codec::encode(&ciphertext),
    })
  }
}

impl Cipher {
  pub fn new(passphrase: impl Into<String>) -> Self {
    Self {
      passphrase: Zeroizing::new(passphrase.into()),
      salt_mode: SaltMode::default(),
      fixed_key: OnceLock::new(),
      salted_key: Mutex::new(None),
    }
  }

  /// Choose the salt mode used by [`Cipher::encrypt`].
  pub fn with_salt_mode(mut self, salt_mode: SaltMode) -> Self {
    self.salt_mode = salt_mode;
    self
  }

  pub fn salt_mode(&self) -> SaltMode {
    self.salt_mode
  }

  fn fixed_key(&self) -> &DerivedKey {
    self
      .fixed_key
      .get_or_init(|| derive_key(&self.passphrase, FIXED_SALT))
  }

  /// Derive the key for a run of encryptions in the configured salt mode.
  pub fn sealer(&self) -> Sealer<'_> {
    match self.salt_mode {
      SaltMode::Fixed => Sealer {
        key: SealKey::Shared(self.fixed_key()),
        salt: None,
      },
      SaltMode::PerBlob => {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Sealer {
          key: SealKey::Owned(derive_key(&self.passphrase, &salt)),
          salt: Some(salt),
        }
      }
    }
  }

  /// Serialize `value` to JSON and seal it under a fresh IV (and, in
  /// per-blob mode, a fresh salt).
  pub fn encrypt<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<EncryptedBlob> {
    self.sealer().encrypt(value)
  }

  /// Open `blob` and deserialize the JSON plaintext.
  ///
  /// Any verification failure is [`CacheError::Authentication`]; no
  /// plaintext is returned in that case.
  pub fn decrypt<T: DeserializeOwned>(&self, blob: &EncryptedBlob) -> CacheResult<T> {
    let ciphertext = codec::decode(&blob.data)?;

    let plaintext = match &blob.salt {
      Some(salt) => {
        let mut cached = self
          .salted_key
          .lock()
          .map_err(|e| CacheError::Crypto(format!("Lock poisoned: {}", e)))?;
        let key = match cached.take() {
          Some((seen, key)) if seen == *salt => key,
          _ => derive_key(&self.passphrase, salt),
        };
        let opened = open(&key, &blob.iv, &ciphertext);
        *cached = Some((*salt, key));
        opened?
      }
      None => open(self.fixed_key(), &blob.iv, &ciphertext)?,
    };

    serde_json::from_slice(&plaintext).map_err(CacheError::format)
  }
}

fn seal(key: &DerivedKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> CacheResult<Vec<u8>> {
  let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
  aead
    .encrypt(Nonce::from_slice(iv), plaintext)
    .map_err(|e| CacheError::Crypto(format!("encryption failed: {e}")))
}

fn open(key: &DerivedKey, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> CacheResult<Zeroizing<Vec<u8>>> {
  let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
  aead
    .decrypt(Nonce::from_slice(iv), ciphertext)
    .map(Zeroizing::new)
    .map_err(|_| CacheError::Authentication)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{json, Value};

  fn sample() -> Value {
    json!({
      "timestamp": 1_700_000_000_000i64,
      "data": [{"id": 1, "created_at": "2024-05-01T10:00:00Z", "PlayerId": "p-1"}],
      "errorData": [],
    })
  }

  #[test]
  fn test_round_trip_per_blob_salt() {
    let cipher = Cipher::new("correct horse");
    let blob = cipher.encrypt(&sample()).unwrap();
    assert!(blob.salt.is_some());
    let back: Value = cipher.decrypt(&blob).unwrap();
    assert_eq!(back, sample());
  }

  #[test]
  fn test_round_trip_fixed_salt() {
    let cipher = Cipher::new("correct horse").with_salt_mode(SaltMode::Fixed);
    let blob = cipher.encrypt(&sample()).unwrap();
    assert!(blob.salt.is_none());
    let back: Value = cipher.decrypt(&blob).unwrap();
    assert_eq!(back, sample());
  }

  #[test]
  fn test_decrypt_selects_mode_from_blob() {
    let fixed = Cipher::new("pw").with_salt_mode(SaltMode::Fixed);
    let per_blob = Cipher::new("pw").with_salt_mode(SaltMode::PerBlob);

    let a = fixed.encrypt(&sample()).unwrap();
    let b = per_blob.encrypt(&sample()).unwrap();

    assert_eq!(per_blob.decrypt::<Value>(&a).unwrap(), sample());
    assert_eq!(fixed.decrypt::<Value>(&b).unwrap(), sample());
  }

  #[test]
  fn test_iv_is_fresh_per_call() {
    let cipher = Cipher::new("pw").with_salt_mode(SaltMode::Fixed);
    let a = cipher.encrypt(&sample()).unwrap();
    let b = cipher.encrypt(&sample()).unwrap();
    assert_ne!(a.iv, b.iv);
    assert_ne!(a.data, b.data);
  }

  #[test]
  fn test_wrong_passphrase_fails_closed() {
    let blob = Cipher::new("pw").encrypt(&sample()).unwrap();
    let err = Cipher::new("other").decrypt::<Value>(&blob).unwrap_err();
    assert!(matches!(err, CacheError::Authentication));
  }

  #[test]
  fn test_flipped_ciphertext_bit_is_detected() {
    let cipher = Cipher::new("pw").with_salt_mode(SaltMode::Fixed);
    let blob = cipher.encrypt(&sample()).unwrap();
    let raw = codec::decode(&blob.data).unwrap();

    for byte in [0, raw.len() / 2, raw.len() - 1] {
      let mut tampered = raw.clone();
      tampered[byte] ^= 0x01;
      let forged = EncryptedBlob {
        data: codec::encode(&tampered),
        ..blob.clone()
      };
      assert!(matches!(
        cipher.decrypt::<Value>(&forged),
        Err(CacheError::Authentication)
      ));
    }
  }

  #[test]
  fn test_flipped_iv_bit_is_detected() {
    let cipher = Cipher::new("pw").with_salt_mode(SaltMode::Fixed);
    let mut blob = cipher.encrypt(&sample()).unwrap();
    blob.iv[IV_LEN - 1] ^= 0x80;
    assert!(matches!(
      cipher.decrypt::<Value>(&blob),
      Err(CacheError::Authentication)
    ));
  }

  #[test]
  fn test_truncated_ciphertext_text_is_format_error() {
    let cipher = Cipher::new("pw").with_salt_mode(SaltMode::Fixed);
    let mut blob = cipher.encrypt(&sample()).unwrap();
    blob.data.truncate(blob.data.len() - 1);
    assert!(matches!(
      cipher.decrypt::<Value>(&blob),
      Err(CacheError::Format(_))
    ));
  }

  #[test]
  fn test_sealer_reuses_salt_with_fresh_ivs() {
    let cipher = Cipher::new("pw");
    let sealer = cipher.sealer();
    let a = sealer.encrypt(&json!([1, 2])).unwrap();
    let b = sealer.encrypt(&json!([3])).unwrap();

    assert!(a.salt.is_some());
    assert_eq!(a.salt, b.salt);
    assert_ne!(a.iv, b.iv);

    // Each blob opens on its own, in any order.
    assert_eq!(cipher.decrypt::<Value>(&b).unwrap(), json!([3]));
    assert_eq!(cipher.decrypt::<Value>(&a).unwrap(), json!([1, 2]));
    assert_eq!(Cipher::new("pw").decrypt::<Value>(&a).unwrap(), json!([1, 2]));
  }

  #[test]
  fn test_separate_writes_get_separate_salts() {
    let cipher = Cipher::new("pw");
    let a = cipher.encrypt(&sample()).unwrap();
    let b = cipher.encrypt(&sample()).unwrap();
    assert_ne!(a.salt, b.salt);
    assert_eq!(cipher.decrypt::<Value>(&a).unwrap(), sample());
    assert_eq!(cipher.decrypt::<Value>(&b).unwrap(), sample());
  }
}
