// =====================================================================================
// 密钥材料：内容加密密钥（AES-256-GCM）与日志签名密钥对（ed25519）
// =====================================================================================
//
// 内容密钥由调用方提供，新旧存储在同一次迁移中使用同一把；
// 签名密钥对是日志的持久身份，迁移时只搬运、不重新生成。

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 对称密钥长度（字节）
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce 长度（字节）
pub const NONCE_LEN: usize = 12;
/// ed25519 签名长度（字节）
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("AES-GCM encrypt failed: {0}")]
    Encrypt(String),

    #[error("AES-GCM decrypt failed (wrong key or corrupted data): {0}")]
    Decrypt(String),

    #[error("sealed payload too short: {0} bytes")]
    TooShort(usize),

    #[error("signature verification failed")]
    BadSignature,
}

/// 内容加密密钥
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ContentKey([u8; KEY_LEN]);

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentKey({}...)", self.fingerprint())
    }
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// 从十六进制字符串解析（配置文件 / 环境变量使用）
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("hex decode: {}", e)))?;
        if bytes.len() != KEY_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(CryptoError::InvalidKey(format!(
                "content key must be {} bytes, got {}",
                KEY_LEN, len
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// 密钥指纹（SHA-256 前 4 字节），只用于日志
    pub fn fingerprint(&self) -> String {
        let fp = Sha256::digest(self.0);
        format!("{:02x}{:02x}{:02x}{:02x}", fp[0], fp[1], fp[2], fp[3])
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// 加密：输出 `nonce(12) ‖ ciphertext+tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// 解密 [`ContentKey::seal`] 的输出
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::TooShort(sealed.len()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}

/// 日志签名密钥对（Feed Identity）
///
/// 序列化为十六进制 `{ "publicKey": .., "secretKey": .. }`，与日志头格式一致。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedKeyPair {
    #[serde(with = "hex::serde")]
    public_key: [u8; KEY_LEN],
    #[serde(with = "hex::serde")]
    secret_key: [u8; KEY_LEN],
}

impl Drop for FeedKeyPair {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

impl std::fmt::Debug for FeedKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedKeyPair")
            .field("public_key", &self.public_hex())
            .finish_non_exhaustive()
    }
}

impl FeedKeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(&signing)
    }

    /// 由私钥种子推导公钥
    pub fn from_secret(secret: [u8; KEY_LEN]) -> Self {
        Self::from_signing_key(&SigningKey::from_bytes(&secret))
    }

    fn from_signing_key(signing: &SigningKey) -> Self {
        Self {
            public_key: signing.verifying_key().to_bytes(),
            secret_key: signing.to_bytes(),
        }
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public_key
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    /// 公钥与私钥是否匹配（日志头完整性检查）
    pub fn is_consistent(&self) -> bool {
        SigningKey::from_bytes(&self.secret_key)
            .verifying_key()
            .to_bytes()
            == self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        SigningKey::from_bytes(&self.secret_key)
            .sign(message)
            .to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let bytes: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| CryptoError::BadSignature)?;
        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        key.verify(message, &Signature::from_bytes(&bytes))
            .map_err(|_| CryptoError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_with_same_key() {
        let key = ContentKey::generate();
        let sealed = key.seal(b"hello drive").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"hello drive");
        assert_eq!(key.open(&sealed).unwrap(), b"hello drive");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = ContentKey::generate().seal(b"secret").unwrap();
        let result = ContentKey::generate().open(&sealed);
        assert!(matches!(result, Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn short_payload_rejected() {
        let key = ContentKey::generate();
        assert!(matches!(key.open(&[1, 2, 3]), Err(CryptoError::TooShort(3))));
    }

    #[test]
    fn content_key_hex_length_checked() {
        assert!(ContentKey::from_hex(&"ab".repeat(32)).is_ok());
        assert!(ContentKey::from_hex("abcd").is_err());
        assert!(ContentKey::from_hex("zz").is_err());
    }

    #[test]
    fn keypair_survives_json() {
        let pair = FeedKeyPair::generate();
        let json = serde_json::to_string(&pair).unwrap();
        assert!(json.contains("publicKey"));
        let back: FeedKeyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair);
        assert!(back.is_consistent());
    }

    #[test]
    fn tampered_public_key_is_inconsistent() {
        let pair = FeedKeyPair::generate();
        let other = FeedKeyPair::generate();
        let forged = FeedKeyPair {
            public_key: other.public_key,
            secret_key: pair.secret_key,
        };
        assert!(!forged.is_consistent());
    }

    #[test]
    fn signatures_verify_only_for_signed_message() {
        let pair = FeedKeyPair::generate();
        let sig = pair.sign(b"block-1");
        assert!(pair.verify(b"block-1", &sig).is_ok());
        assert!(pair.verify(b"block-2", &sig).is_err());
        assert!(pair.verify(b"block-1", &sig[..10]).is_err());
    }
}
