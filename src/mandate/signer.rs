//! 委托签名器
//!
//! 密钥管理属于外部协作方，这里只定义签名接口，并提供 HMAC-SHA256 实现。

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::core::AuthzError;

type HmacSha256 = Hmac<Sha256>;

/// 签名接口
pub trait MandateSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Result<String, AuthzError>;

    /// 常量时间比较
    fn verify(&self, payload: &[u8], signature: &str) -> bool;
}

/// HMAC-SHA256 签名器
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// 从环境变量读取密钥；未设置时生成进程内随机密钥（重启后旧委托全部失效）
    pub fn from_env(var: &str) -> Self {
        match std::env::var(var) {
            Ok(k) if !k.is_empty() => Self::new(k.into_bytes()),
            _ => {
                tracing::warn!(var, "mandate signing key not set, using an ephemeral key");
                let key = format!("{}{}", uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
                Self::new(key.into_bytes())
            }
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthzError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| AuthzError::Signing(e.to_string()))
    }
}

impl MandateSigner for HmacSigner {
    fn sign(&self, payload: &[u8]) -> Result<String, AuthzError> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = HmacSigner::new(b"secret".to_vec());
        let sig = signer.sign(b"payload").unwrap();
        assert!(signer.verify(b"payload", &sig));
        assert!(!signer.verify(b"payload2", &sig));
        assert!(!signer.verify(b"payload", "not-hex"));
        assert!(!HmacSigner::new(b"other".to_vec()).verify(b"payload", &sig));
    }
}
