//! AES-128-CBC fragment decryption and key management.

use crate::error::{ErrorKind, JobError};
use crate::transport::{self, CancelToken, TransportRequest};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128 keys are exactly 16 bytes.
const KEY_LEN: usize = 16;

/// Derive the fragment IV: explicit `IV=0x...` from the playlist when
/// present, otherwise the big-endian 128-bit media sequence number.
pub fn derive_iv(explicit_hex: Option<&str>, sequence: u64) -> Result<[u8; 16], JobError> {
    match explicit_hex {
        Some(iv_hex) => {
            let trimmed = iv_hex.trim_start_matches("0x").trim_start_matches("0X");
            let mut iv = [0u8; 16];
            hex::decode_to_slice(trimmed, &mut iv).map_err(|e| {
                JobError::new(ErrorKind::DecryptFailed, format!("bad IV '{}': {}", iv_hex, e))
            })?;
            Ok(iv)
        }
        None => {
            let mut iv = [0u8; 16];
            iv[8..].copy_from_slice(&sequence.to_be_bytes());
            Ok(iv)
        }
    }
}

/// Decrypt a whole fragment in memory. PKCS#7 padding is stripped.
pub fn decrypt_aes128_cbc(
    mut data: Vec<u8>,
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Vec<u8>, JobError> {
    let cipher = Aes128CbcDec::new(key.into(), iv.into());
    let len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut data)
        .map_err(|e| JobError::new(ErrorKind::DecryptFailed, format!("decrypt: {}", e)))?
        .len();
    data.truncate(len);
    Ok(data)
}

/// Decrypt a downloaded part file in place.
pub fn decrypt_part_file(path: &Path, key: &[u8; 16], iv: &[u8; 16]) -> Result<(), JobError> {
    let data = std::fs::read(path)
        .map_err(|e| JobError::new(ErrorKind::DecryptFailed, format!("read part: {}", e)))?;
    let plain = decrypt_aes128_cbc(data, key, iv)?;
    std::fs::write(path, plain)
        .map_err(|e| JobError::new(ErrorKind::DecryptFailed, format!("write part: {}", e)))?;
    Ok(())
}

/// Fetches AES keys over the job's transport settings, once per URL.
pub struct KeyCache {
    keys: Mutex<HashMap<String, [u8; 16]>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Seed with a pre-shared key from the extractor (hex).
    pub fn seed_hex(&self, url: &str, key_hex: &str) -> Result<(), JobError> {
        let mut key = [0u8; KEY_LEN];
        hex::decode_to_slice(key_hex, &mut key).map_err(|e| {
            JobError::new(ErrorKind::DecryptFailed, format!("bad pre-shared key: {}", e))
        })?;
        self.keys.lock().unwrap().insert(url.to_string(), key);
        Ok(())
    }

    /// Get the key for `url`, fetching it when unseen.
    pub fn get(
        &self,
        url: &str,
        template: &TransportRequest,
        cancel: &CancelToken,
    ) -> Result<[u8; 16], JobError> {
        if let Some(k) = self.keys.lock().unwrap().get(url) {
            return Ok(*k);
        }
        let mut req = template.clone();
        req.url = url.to_string();
        req.range = None;
        let (_, body) = transport::fetch_to_vec(&req, cancel, 1024).map_err(|e| JobError {
            kind: ErrorKind::DecryptFailed,
            http_status: e.http_status(),
            message: format!("key fetch: {}", e),
        })?;
        if body.len() != KEY_LEN {
            return Err(JobError::new(
                ErrorKind::DecryptFailed,
                format!("key from {} is {} bytes, expected {}", url, body.len(), KEY_LEN),
            ));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&body);
        self.keys.lock().unwrap().insert(url.to_string(), key);
        Ok(key)
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    fn encrypt(plain: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let padded_len = (plain.len() / 16 + 1) * 16;
        let mut buf = vec![0u8; padded_len];
        buf[..plain.len()].copy_from_slice(plain);
        let cipher = Aes128CbcEnc::new(key.into(), iv.into());
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
            .unwrap()
            .to_vec()
    }

    #[test]
    fn explicit_iv_parses_with_and_without_prefix() {
        let iv = derive_iv(Some("0x000102030405060708090a0b0c0d0e0f"), 99).unwrap();
        assert_eq!(iv[0], 0);
        assert_eq!(iv[15], 0x0f);
        let iv2 = derive_iv(Some("000102030405060708090a0b0c0d0e0f"), 99).unwrap();
        assert_eq!(iv, iv2);
    }

    #[test]
    fn sequence_iv_is_big_endian_128() {
        let iv = derive_iv(None, 5).unwrap();
        let mut expected = [0u8; 16];
        expected[15] = 5;
        assert_eq!(iv, expected);

        let iv = derive_iv(None, 0x0102).unwrap();
        assert_eq!(iv[14], 0x01);
        assert_eq!(iv[15], 0x02);
        assert_eq!(&iv[..14], &[0u8; 14]);
    }

    #[test]
    fn bad_iv_is_an_error() {
        assert!(derive_iv(Some("zz"), 0).is_err());
    }

    #[test]
    fn decrypt_round_trip() {
        let key = [0x42u8; 16];
        let iv = derive_iv(None, 7).unwrap();
        let plain = b"TS payload bytes, arbitrary length.";
        let enc = encrypt(plain, &key, &iv);
        let dec = decrypt_aes128_cbc(enc, &key, &iv).unwrap();
        assert_eq!(dec, plain);
    }

    #[test]
    fn decrypt_part_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part-000001");
        let key = [0x11u8; 16];
        let iv = derive_iv(None, 1).unwrap();
        std::fs::write(&path, encrypt(b"fragment one", &key, &iv)).unwrap();
        decrypt_part_file(&path, &key, &iv).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"fragment one");
    }

    #[test]
    fn key_cache_seeding() {
        let cache = KeyCache::new();
        cache
            .seed_hex("http://k/1", "00112233445566778899aabbccddeeff")
            .unwrap();
        let req = TransportRequest::get("http://unused/");
        let k = cache.get("http://k/1", &req, &CancelToken::new()).unwrap();
        assert_eq!(k[0], 0x00);
        assert_eq!(k[15], 0xff);
    }
}
