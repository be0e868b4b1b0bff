//! 会话上下文（版本化 schema）
//!
//! 每个会话一份 SessionContext：首条消息时惰性创建，由步骤处理器通过 ContextUpdate 修改，
//! 每次修改后持久化，从不显式销毁。`version` 用于乐观并发，`schema_version` 用于迁移。

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::StoreError;
use crate::discovery::DiscoveredField;
use crate::flow::Step;
use crate::mandate::SignedMandate;

/// 当前 schema 版本
pub const SCHEMA_VERSION: u32 = 2;

/// 报名机构（provider）引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub org_ref: Option<String>,
}

/// 课程 / 项目引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRef {
    pub id: String,
    pub title: String,
    /// 价格（分）；授权委托的 max_amount 以此为上限
    #[serde(default)]
    pub price_cents: Option<u64>,
}

/// 报名的孩子
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    pub id: String,
    pub name: String,
}

/// 用户意图：项目类别与孩子年龄
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub category: Option<String>,
    pub child_age: Option<u8>,
}

impl Intent {
    pub fn is_complete(&self) -> bool {
        self.category.is_some() && self.child_age.is_some()
    }
}

/// 单项前置条件检查结果（会员、免责声明、付款方式……）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// 会话上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionContext {
    pub schema_version: u32,
    /// 乐观并发版本号：每次成功写入 +1，0 表示尚未持久化
    pub version: u64,
    pub session_id: String,
    /// 委托主体（principal）
    pub user_id: Option<String>,
    pub provider: Option<ProviderRef>,
    pub credential_ref: Option<String>,
    pub login_confirmed: bool,
    pub session_token: Option<String>,
    pub session_token_expires_at: Option<DateTime<Utc>>,
    pub mandate: Option<SignedMandate>,
    pub intent: Intent,
    pub discovered_fields: Option<Vec<DiscoveredField>>,
    pub discovery_confidence: Option<f64>,
    pub program: Option<ProgramRef>,
    pub child: Option<ChildRef>,
    pub prerequisites: Option<Vec<PrerequisiteResult>>,
    pub form_answers: BTreeMap<String, String>,
    pub form_complete: bool,
    pub registration_ref: Option<String>,
    pub current_step: Option<Step>,
    pub last_provider_query: Option<String>,
    pub retry_counts: BTreeMap<String, u32>,
    pub cache_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            version: 0,
            session_id: String::new(),
            user_id: None,
            provider: None,
            credential_ref: None,
            login_confirmed: false,
            session_token: None,
            session_token_expires_at: None,
            mandate: None,
            intent: Intent::default(),
            discovered_fields: None,
            discovery_confidence: None,
            program: None,
            child: None,
            prerequisites: None,
            form_answers: BTreeMap::new(),
            form_complete: false,
            registration_ref: None,
            current_step: None,
            last_provider_query: None,
            retry_counts: BTreeMap::new(),
            cache_keys: Vec::new(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, user_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id,
            created_at: now,
            updated_at: now,
            ..Self::default()
        }
    }

    /// 会话令牌是否还有超过 margin 的剩余有效期
    pub fn session_token_valid_for(&self, now: DateTime<Utc>, margin: chrono::Duration) -> Option<&str> {
        match (&self.session_token, self.session_token_expires_at) {
            (Some(token), Some(expires)) if expires - now > margin => Some(token.as_str()),
            _ => None,
        }
    }

    /// 所有必填的探测字段都已有答案
    pub fn missing_required_fields(&self) -> Vec<&DiscoveredField> {
        self.discovered_fields
            .iter()
            .flatten()
            .filter(|f| f.required && !self.form_answers.contains_key(&f.id))
            .collect()
    }

    pub fn apply(&mut self, update: &ContextUpdate) {
        match update {
            ContextUpdate::Provider(p) => {
                if self.provider.as_ref().map(|cur| &cur.id) != Some(&p.id) {
                    self.reset_provider_scoped();
                }
                self.provider = Some(p.clone());
            }
            ContextUpdate::ClearProvider => {
                self.reset_provider_scoped();
                self.provider = None;
            }
            ContextUpdate::ProviderQuery(q) => self.last_provider_query = Some(q.clone()),
            ContextUpdate::CredentialRef(r) => {
                self.credential_ref = Some(r.clone());
                self.login_confirmed = false;
            }
            ContextUpdate::LoginConfirmed(v) => self.login_confirmed = *v,
            ContextUpdate::ClearSession => {
                self.login_confirmed = false;
                self.session_token = None;
                self.session_token_expires_at = None;
            }
            ContextUpdate::IntentCategory(c) => self.intent.category = Some(c.clone()),
            ContextUpdate::ChildAge(a) => self.intent.child_age = Some(*a),
            ContextUpdate::Child(c) => self.child = Some(c.clone()),
            ContextUpdate::DiscoveredFields { fields, confidence } => {
                self.discovered_fields = Some(fields.clone());
                self.discovery_confidence = Some(*confidence);
            }
            ContextUpdate::Program(p) => {
                self.program = Some(p.clone());
                self.prerequisites = None;
                self.form_complete = false;
            }
            ContextUpdate::ClearProgram => {
                self.program = None;
                self.prerequisites = None;
                self.form_complete = false;
                self.registration_ref = None;
            }
            ContextUpdate::Prerequisites(list) => self.prerequisites = Some(list.clone()),
            ContextUpdate::FormAnswer { field, value } => {
                self.form_answers.insert(field.clone(), value.clone());
            }
            ContextUpdate::FormComplete => self.form_complete = true,
            ContextUpdate::ReopenForm => self.form_complete = false,
            ContextUpdate::Registration(r) => self.registration_ref = Some(r.clone()),
            ContextUpdate::CurrentStep(s) => self.current_step = Some(*s),
            ContextUpdate::Mandate(m) => self.mandate = m.clone(),
            ContextUpdate::SessionToken { token, expires_at } => {
                self.session_token = token.clone();
                self.session_token_expires_at = *expires_at;
            }
            ContextUpdate::RecordCacheKey(k) => {
                if !self.cache_keys.contains(k) {
                    self.cache_keys.push(k.clone());
                }
            }
            ContextUpdate::BumpRetry(k) => *self.retry_counts.entry(k.clone()).or_insert(0) += 1,
            ContextUpdate::ResetRetry(k) => {
                self.retry_counts.remove(k);
            }
            ContextUpdate::StartOver => {
                let keep = SessionContext::new(self.session_id.clone(), self.user_id.clone(), self.created_at);
                *self = SessionContext {
                    version: self.version,
                    credential_ref: self.credential_ref.take(),
                    updated_at: self.updated_at,
                    ..keep
                };
            }
        }
    }

    pub fn apply_all(&mut self, updates: &[ContextUpdate], now: DateTime<Utc>) {
        for u in updates {
            self.apply(u);
        }
        self.updated_at = now;
    }

    /// 更换 provider 时，登录、令牌、委托及其后续步骤全部失效
    fn reset_provider_scoped(&mut self) {
        self.login_confirmed = false;
        self.session_token = None;
        self.session_token_expires_at = None;
        self.mandate = None;
        self.discovered_fields = None;
        self.discovery_confidence = None;
        self.program = None;
        self.prerequisites = None;
        self.form_answers.clear();
        self.form_complete = false;
        self.registration_ref = None;
    }
}

/// 步骤处理器产出的上下文变更（闭合枚举，按顺序应用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum ContextUpdate {
    Provider(ProviderRef),
    ClearProvider,
    ProviderQuery(String),
    CredentialRef(String),
    LoginConfirmed(bool),
    /// 重新连接账号：丢弃登录状态与会话令牌
    ClearSession,
    IntentCategory(String),
    ChildAge(u8),
    Child(ChildRef),
    DiscoveredFields {
        fields: Vec<DiscoveredField>,
        confidence: f64,
    },
    Program(ProgramRef),
    ClearProgram,
    Prerequisites(Vec<PrerequisiteResult>),
    FormAnswer {
        field: String,
        value: String,
    },
    FormComplete,
    ReopenForm,
    Registration(String),
    CurrentStep(Step),
    /// 网关签发或吊销委托后的结果（内部变更，不对外输出）
    Mandate(Option<SignedMandate>),
    /// 网关写回的会话令牌（内部变更）
    SessionToken {
        token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    RecordCacheKey(String),
    BumpRetry(String),
    ResetRetry(String),
    StartOver,
}

impl ContextUpdate {
    /// 网关内部状态的变更，不出现在对外的 contextUpdates 中
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ContextUpdate::Mandate(_) | ContextUpdate::SessionToken { .. } | ContextUpdate::RecordCacheKey(_)
        )
    }

    /// 对外 `contextUpdates` 映射中的键
    pub fn field_name(&self) -> String {
        match self {
            ContextUpdate::FormAnswer { field, .. } => format!("form_answers.{field}"),
            ContextUpdate::BumpRetry(k) | ContextUpdate::ResetRetry(k) => format!("retry_counts.{k}"),
            other => serde_json::to_value(other)
                .ok()
                .and_then(|v| v.get("field").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    pub fn value_json(&self) -> Value {
        match self {
            ContextUpdate::FormAnswer { value, .. } => Value::String(value.clone()),
            ContextUpdate::ResetRetry(_) => Value::Null,
            other => serde_json::to_value(other)
                .ok()
                .and_then(|mut v| v.get_mut("value").map(Value::take))
                .unwrap_or(Value::Bool(true)),
        }
    }
}

/// 将任意版本的持久化 JSON 迁移为当前 schema
///
/// - schema_version == 2：直接反序列化
/// - 缺失或 == 1：旧版扁平结构（camelCase / 字符串引用），逐字段映射；旧版未签名的 mandate 引用被丢弃，下次受保护调用时重新签发
pub fn migrate(raw: Value) -> Result<SessionContext, StoreError> {
    let version = raw
        .get("schema_version")
        .or_else(|| raw.get("schemaVersion"))
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    match version {
        SCHEMA_VERSION => Ok(serde_json::from_value(raw)?),
        1 => Ok(migrate_v1(&raw)),
        other => Err(StoreError::UnsupportedSchema(other)),
    }
}

fn migrate_v1(raw: &Value) -> SessionContext {
    let s = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|k| raw.get(*k))
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    };
    let ts = |keys: &[&str]| -> Option<DateTime<Utc>> {
        keys.iter().find_map(|k| raw.get(*k)).and_then(|v| match v {
            Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
            _ => None,
        })
    };

    let provider = match raw.get("provider") {
        Some(Value::String(name)) if !name.is_empty() => Some(ProviderRef {
            id: s(&["providerId", "provider_id"]).unwrap_or_else(|| slug(name)),
            name: name.clone(),
            org_ref: s(&["orgRef", "org_ref"]),
        }),
        Some(obj @ Value::Object(_)) => serde_json::from_value(obj.clone()).ok(),
        _ => None,
    };

    let program = match raw.get("program").or_else(|| raw.get("selectedProgram")) {
        Some(Value::String(id)) if !id.is_empty() => Some(ProgramRef {
            id: id.clone(),
            title: s(&["programTitle", "program_title"]).unwrap_or_else(|| id.clone()),
            price_cents: None,
        }),
        Some(obj @ Value::Object(_)) => serde_json::from_value(obj.clone()).ok(),
        _ => None,
    };

    let prerequisites = raw
        .get("prerequisites")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .map(|(name, v)| PrerequisiteResult {
                    name: name.clone(),
                    passed: v.as_bool().unwrap_or(false),
                    detail: None,
                })
                .collect::<Vec<_>>()
        });

    let login_confirmed = raw
        .get("loginStatus")
        .and_then(Value::as_str)
        .map(|st| st == "success")
        .unwrap_or(false);

    let retry_counts = raw
        .get("retryCount")
        .and_then(Value::as_u64)
        .filter(|n| *n > 0)
        .map(|n| BTreeMap::from([("flow".to_string(), n as u32)]))
        .unwrap_or_default();

    let created = ts(&["createdAt", "created_at"]).unwrap_or_default();

    SessionContext {
        schema_version: SCHEMA_VERSION,
        version: raw.get("version").and_then(Value::as_u64).unwrap_or(0),
        session_id: s(&["sessionId", "session_id"]).unwrap_or_default(),
        user_id: s(&["userId", "user_id"]),
        provider,
        credential_ref: s(&["credential_id", "credentialId", "credentialRef"]),
        login_confirmed,
        session_token: s(&["session_token", "sessionToken"]),
        session_token_expires_at: ts(&["session_token_expires_at", "sessionTokenExpiresAt"]),
        mandate: None,
        intent: Intent {
            category: s(&["category", "intentCategory"]),
            child_age: raw
                .get("childAge")
                .or_else(|| raw.get("child_age"))
                .and_then(Value::as_u64)
                .and_then(|a| u8::try_from(a).ok()),
        },
        program,
        prerequisites,
        retry_counts,
        created_at: created,
        updated_at: ts(&["updatedAt", "updated_at"]).unwrap_or(created),
        ..SessionContext::default()
    }
}

fn slug(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
