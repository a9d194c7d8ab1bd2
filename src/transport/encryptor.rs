// 逐帧流加密
//
// 密钥与 IV 通过 EVP_BytesToKey(MD5, 无盐, 1 轮) 由密码派生，
// 每一帧都以相同的密钥与 IV 重新初始化加密上下文

use crate::error::{Result, TunnelError};
use openssl::hash::MessageDigest;
use openssl::pkcs5::bytes_to_key;
use openssl::symm::{Cipher, Crypter, Mode};
use std::fmt;

/// 支持的流模式算法
const METHODS: &[&str] = &[
    "aes-128-cfb",
    "aes-192-cfb",
    "aes-256-cfb",
    "aes-128-cfb8",
    "aes-192-cfb8",
    "aes-256-cfb8",
    "aes-128-cfb1",
    "aes-192-cfb1",
    "aes-256-cfb1",
    "aes-128-ofb",
    "aes-192-ofb",
    "aes-256-ofb",
    "aes-128-ctr",
    "aes-192-ctr",
    "aes-256-ctr",
    "chacha20",
];

fn cipher_by_name(method: &str) -> Option<Cipher> {
    let cipher = match method.trim().to_ascii_lowercase().as_str() {
        "aes-128-cfb" | "aes-128-cfb128" => Cipher::aes_128_cfb128(),
        "aes-192-cfb" | "aes-192-cfb128" => Cipher::aes_192_cfb128(),
        "aes-256-cfb" | "aes-256-cfb128" => Cipher::aes_256_cfb128(),
        "aes-128-cfb8" => Cipher::aes_128_cfb8(),
        "aes-192-cfb8" => Cipher::aes_192_cfb8(),
        "aes-256-cfb8" => Cipher::aes_256_cfb8(),
        "aes-128-cfb1" => Cipher::aes_128_cfb1(),
        "aes-192-cfb1" => Cipher::aes_192_cfb1(),
        "aes-256-cfb1" => Cipher::aes_256_cfb1(),
        "aes-128-ofb" => Cipher::aes_128_ofb(),
        "aes-192-ofb" => Cipher::aes_192_ofb(),
        "aes-256-ofb" => Cipher::aes_256_ofb(),
        "aes-128-ctr" => Cipher::aes_128_ctr(),
        "aes-192-ctr" => Cipher::aes_192_ctr(),
        "aes-256-ctr" => Cipher::aes_256_ctr(),
        "chacha20" => Cipher::chacha20(),
        _ => return None,
    };
    Some(cipher)
}

/// 流加密器
pub struct Encryptor {
    method: String,
    cipher: Cipher,
    key: Vec<u8>,
    iv: Option<Vec<u8>>,
}

impl Encryptor {
    /// 按算法名与密码创建加密器，算法不支持或初始化失败时返回错误
    pub fn new(method: &str, password: &str) -> Result<Self> {
        let cipher = cipher_by_name(method)
            .ok_or_else(|| TunnelError::config_error(format!("Unsupported cipher: {}", method)))?;

        let pair = bytes_to_key(cipher, MessageDigest::md5(), password.as_bytes(), None, 1)
            .map_err(|e| TunnelError::config_error(format!("Key derivation failed: {}", e)))?;

        let encryptor = Self {
            method: method.trim().to_ascii_lowercase(),
            cipher,
            key: pair.key,
            iv: pair.iv,
        };

        // 提前构造一次上下文，确认当前 OpenSSL 可用该算法
        encryptor.crypter(Mode::Encrypt)?;
        Ok(encryptor)
    }

    /// 算法名是否受支持
    pub fn is_supported(method: &str) -> bool {
        cipher_by_name(method).is_some()
    }

    /// 全部支持的算法名
    pub fn methods() -> &'static [&'static str] {
        METHODS
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// 加密一帧，结果写入 `output`
    pub fn encrypt(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        self.apply(Mode::Encrypt, input, output)
    }

    /// 解密一帧，结果写入 `output`
    pub fn decrypt(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        self.apply(Mode::Decrypt, input, output)
    }

    fn crypter(&self, mode: Mode) -> Result<Crypter> {
        let mut crypter = Crypter::new(self.cipher, mode, &self.key, self.iv.as_deref())
            .map_err(|e| {
                TunnelError::transport(format!("Failed to init cipher {}: {}", self.method, e))
            })?;
        crypter.pad(false);
        Ok(crypter)
    }

    fn apply(&self, mode: Mode, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let mut crypter = self.crypter(mode)?;
        output.clear();
        output.resize(input.len() + self.cipher.block_size(), 0);
        let n = crypter
            .update(input, output)
            .map_err(|e| TunnelError::transport(format!("Cipher update failed: {}", e)))?;
        output.truncate(n);
        Ok(())
    }
}

impl fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryptor")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_methods_construct() {
        for method in Encryptor::methods() {
            assert!(
                Encryptor::new(method, "password").is_ok(),
                "method {} failed",
                method
            );
        }
    }

    #[test]
    fn test_unsupported_method() {
        assert!(!Encryptor::is_supported("aes-256-cbc"));
        let err = Encryptor::new("rot13", "password").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_encrypt_decrypt() {
        let encryptor = Encryptor::new("aes-256-cfb", "secret").unwrap();
        let plain = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let mut cipher_text = Vec::new();
        encryptor.encrypt(plain, &mut cipher_text).unwrap();
        assert_eq!(cipher_text.len(), plain.len());
        assert_ne!(&cipher_text[..], &plain[..]);

        let mut decoded = Vec::new();
        encryptor.decrypt(&cipher_text, &mut decoded).unwrap();
        assert_eq!(&decoded[..], &plain[..]);
    }

    #[test]
    fn test_every_frame_restarts_keystream() {
        let encryptor = Encryptor::new("aes-128-ctr", "secret").unwrap();
        let mut first = Vec::new();
        let mut second = Vec::new();
        encryptor.encrypt(b"same payload", &mut first).unwrap();
        encryptor.encrypt(b"same payload", &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_different_passwords_differ() {
        let a = Encryptor::new("chacha20", "alpha").unwrap();
        let b = Encryptor::new("chacha20", "bravo").unwrap();
        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        a.encrypt(b"payload", &mut out_a).unwrap();
        b.encrypt(b"payload", &mut out_b).unwrap();
        assert_ne!(out_a, out_b);
    }
}
