//! 授权委托（mandate）声明
//!
//! 签名覆盖的是「规范化声明」的字节：字段顺序固定、scope 用 BTreeSet 排序、时间用毫秒时间戳，
//! 同一组声明在任何进程里序列化结果都一致。

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 委托可授予的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// 以用户身份登录 provider
    Authenticate,
    /// 读取课程列表、账号状态
    Read,
    /// 运行表单字段探测
    DiscoverFields,
    /// 提交报名
    Register,
    /// 发起付款
    Pay,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Authenticate => "authenticate",
            Capability::Read => "read",
            Capability::DiscoverFields => "discover_fields",
            Capability::Register => "register",
            Capability::Pay => "pay",
        };
        f.write_str(s)
    }
}

/// 被签名的声明集合
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateClaims {
    /// 委托 id 也在签名范围内，账本状态按它查找
    pub mandate_id: Uuid,
    pub subject: String,
    pub provider: String,
    pub scope: BTreeSet<Capability>,
    pub program_ref: Option<String>,
    /// 授权金额上限（分）
    #[serde(rename = "max_amount")]
    pub max_amount_cents: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub valid_from: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub valid_until: DateTime<Utc>,
}

impl MandateClaims {
    /// 规范化字节（签名输入）
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// 返回 required 中 scope 未覆盖的能力
    pub fn missing(&self, required: &[Capability]) -> Vec<Capability> {
        required
            .iter()
            .filter(|c| !self.scope.contains(c))
            .copied()
            .collect()
    }

    /// now 落在 [valid_from, valid_until - margin) 内
    pub fn valid_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.valid_from <= now && self.valid_until - now > margin
    }
}

/// 委托状态；签名不覆盖状态，状态只由签发方的账本决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MandateStatus {
    Active,
    Superseded,
    Revoked,
}

/// 已签名的委托；签发后不可变，只能被新委托取代
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMandate {
    pub id: Uuid,
    pub claims: MandateClaims,
    /// HMAC 等签名的十六进制串
    pub signature: String,
}

impl SignedMandate {
    /// 外层 id 必须与签名声明中的 id 一致
    pub fn id_matches_claims(&self) -> bool {
        self.id == self.claims.mandate_id
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.claims.valid_until
    }

    /// 注入工具参数时的线上形态
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "claims": self.claims,
            "signature": self.signature,
        })
    }
}
