use std::sync::atomic::{AtomicU64, Ordering};

use aead::{AeadInPlace, Generate, Key, KeyInit, Nonce};
use aes_gcm::Aes256Gcm;
use anyhow::bail;
use bytes::BytesMut;

/// End-to-end encryption of individual frames on the service connection.
/// The ciphertext of each frame is self-contained: the nonce travels as a
/// 12-byte suffix.
pub trait FrameEncryption: Send + Sync {
    fn encrypt_buffer(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn decrypt_buffer(&self, buf: &mut BytesMut) -> anyhow::Result<()>;
}

/// Plaintext pass-through for loopback tests.
pub struct NoEncryption;
impl FrameEncryption for NoEncryption {
    fn encrypt_buffer(&self, _buf: &mut BytesMut) -> anyhow::Result<()> {
        Ok(())
    }

    fn decrypt_buffer(&self, _buf: &mut BytesMut) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Aes256GcmEncryption {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl Aes256GcmEncryption {
    /// key must be exactly 32 bytes
    pub fn new(key: &[u8]) -> Aes256GcmEncryption {
        let key = Key::<Aes256Gcm>::from_slice(key);
        let cipher = Aes256Gcm::new(key);

        // random starting point, incremented by an odd stride per frame so
        // nonces never repeat within a connection's lifetime
        let seed = Nonce::<Aes256Gcm>::generate();
        let nonce_fixed = u32::from_le_bytes([seed[0], seed[1], seed[2], seed[3]]);
        let nonce_incremented = AtomicU64::new(u64::from_le_bytes([
            seed[4], seed[5], seed[6], seed[7], seed[8], seed[9], seed[10], seed[11],
        ]));

        Aes256GcmEncryption {
            cipher,
            nonce_fixed,
            nonce_incremented,
        }
    }

    fn unique_nonce(&self) -> Nonce<Aes256Gcm> {
        let mut raw = [0u8; 12];
        raw[..4].copy_from_slice(&self.nonce_fixed.to_le_bytes());
        raw[4..].copy_from_slice(&self.nonce_incremented.fetch_add(37, Ordering::AcqRel).to_le_bytes());
        Nonce::<Aes256Gcm>::clone_from_slice(&raw)
    }
}

impl FrameEncryption for Aes256GcmEncryption {
    fn encrypt_buffer(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let nonce = self.unique_nonce();
        if self.cipher.encrypt_in_place(&nonce, b"", buf).is_err() {
            bail!("frame encryption failed");
        }
        buf.extend_from_slice(nonce.as_slice());
        Ok(())
    }

    fn decrypt_buffer(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        if buf.len() < 12 {
            bail!("received buffer too short to carry a nonce");
        }
        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(&buf.as_ref()[buf.len() - 12..]);
        buf.truncate(buf.len() - 12);
        if self.cipher.decrypt_in_place(&nonce, b"", buf).is_err() {
            bail!("frame decryption failed");
        }
        Ok(())
    }
}
