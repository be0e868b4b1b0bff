//! 工具调用网关
//!
//! invoke(tool, args, &mut ctx) 的处理顺序：
//! 1. 未注册工具：有 fallback 则转发，否则 UnknownTool，从不重试
//! 2. 受保护工具：ensure_mandate，参数中注入 mandate / subject / provider，会话令牌剩余 > 30s 时注入
//! 3. 可缓存工具：命中直接返回；未命中按缓存键单飞
//! 4. 开启会话的工具：按 (subject, provider) 单飞
//! 5. 每次尝试带超时，瞬时失败沿退避表重试；授权失败吊销委托后重新签发，仅一次
//! 6. 成功响应中的 session_token 写回上下文
//!
//! 每次调用输出一条 JSON 审计日志（参数已脱敏）并计入 ToolStats。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use super::outcome::{classify_response, classify_transport, Outcome};
use super::registry::{Tool, ToolRegistry};
use super::retry::RetryPolicy;
use super::stats::ToolStats;
use crate::cache::{cache_key, CacheMeta, ResultCache};
use crate::core::sanitize::{args_preview, sanitize_detail};
use crate::core::{AuthzError, Clock, SingleFlight, ToolError};
use crate::mandate::MandateAuthority;
use crate::session::SessionContext;

/// 网关参数
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// 单次尝试默认超时
    pub default_timeout: Duration,
    /// 会话令牌剩余有效期大于该值才注入
    pub session_token_margin: chrono::Duration,
    /// 响应未给出过期时间时的令牌有效期
    pub session_token_ttl: chrono::Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            session_token_margin: chrono::Duration::seconds(30),
            session_token_ttl: chrono::Duration::minutes(30),
        }
    }
}

/// 一次完整尝试序列的结果（单飞共享）
#[derive(Debug, Clone)]
struct Attempted {
    result: Result<Value, ToolError>,
    attempts: u32,
}

struct Dispatched {
    result: Result<Value, ToolError>,
    attempts: u32,
    cache_hit: bool,
    cache_key: Option<String>,
}

pub struct ToolGateway {
    registry: ToolRegistry,
    fallback: Option<String>,
    authority: Arc<MandateAuthority>,
    cache: Arc<ResultCache>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    settings: GatewaySettings,
    sessions: SingleFlight<(String, String), Attempted>,
    stats: ToolStats,
}

impl ToolGateway {
    pub fn new(
        registry: ToolRegistry,
        authority: Arc<MandateAuthority>,
        cache: Arc<ResultCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            fallback: None,
            authority,
            cache,
            clock,
            retry: RetryPolicy::default(),
            settings: GatewaySettings::default(),
            sessions: SingleFlight::new(),
            stats: ToolStats::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_settings(mut self, settings: GatewaySettings) -> Self {
        self.settings = settings;
        self
    }

    /// 未注册工具转发到该工具（必须已注册）
    pub fn with_fallback(mut self, tool: impl Into<String>) -> Self {
        self.fallback = Some(tool.into());
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn authority(&self) -> &Arc<MandateAuthority> {
        &self.authority
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn stats(&self) -> &ToolStats {
        &self.stats
    }

    /// 会话建立类调用的实际执行次数
    pub fn session_executions(&self) -> u64 {
        self.sessions.executions()
    }

    pub async fn invoke(
        &self,
        tool_name: &str,
        args: Value,
        ctx: &mut SessionContext,
    ) -> Result<Value, ToolError> {
        let start = Instant::now();
        let preview = args_preview(&args);

        let Some((name, tool)) = self.resolve(tool_name) else {
            let err = ToolError::UnknownTool(tool_name.to_string());
            self.finish(tool_name, &preview, &Err(err.clone()), 0, false, start);
            return Err(err);
        };
        let protected = !tool.required_capabilities().is_empty();

        let mut refreshed = false;
        let mut attempts = 0;
        let mut cache_hit = false;
        let result = loop {
            let prepared = match self.prepare_args(tool.as_ref(), &args, ctx).await {
                Ok(prepared) => prepared,
                Err(e) => break Err(ToolError::Authz(e)),
            };
            let call = self.dispatch(&name, &tool, prepared, ctx).await;
            attempts += call.attempts;
            cache_hit = call.cache_hit;
            if let Some(key) = call.cache_key {
                if !ctx.cache_keys.contains(&key) {
                    ctx.cache_keys.push(key);
                }
            }
            match call.result {
                Err(ToolError::Authorization { .. }) if protected && !refreshed => {
                    refreshed = true;
                    tracing::warn!(tool = %name, "downstream rejected authorization, refreshing mandate once");
                    self.authority.invalidate(ctx).await;
                }
                other => break other,
            }
        };

        if let Ok(value) = &result {
            self.write_back_session(value, ctx);
        }
        self.finish(&name, &preview, &result, attempts, cache_hit, start);
        result
    }

    fn resolve(&self, tool_name: &str) -> Option<(String, Arc<dyn Tool>)> {
        if let Some(tool) = self.registry.get(tool_name) {
            return Some((tool_name.to_string(), tool));
        }
        let fallback = self.fallback.as_ref()?;
        let tool = self.registry.get(fallback)?;
        tracing::warn!(requested = tool_name, fallback = %fallback, "unknown tool routed to fallback");
        Some((fallback.clone(), tool))
    }

    /// 受保护工具：确保委托并注入鉴权字段
    async fn prepare_args(
        &self,
        tool: &dyn Tool,
        args: &Value,
        ctx: &mut SessionContext,
    ) -> Result<Value, AuthzError> {
        let mut map = match args {
            Value::Object(m) => m.clone(),
            Value::Null => Map::new(),
            other => Map::from_iter([("input".to_string(), other.clone())]),
        };
        let required = tool.required_capabilities();
        if required.is_empty() {
            return Ok(Value::Object(map));
        }

        self.authority.ensure_mandate(ctx, required).await?;
        if let Some(mandate) = &ctx.mandate {
            map.insert("mandate".into(), mandate.to_wire());
        }
        if let Some(user) = &ctx.user_id {
            map.insert("subject".into(), Value::String(user.clone()));
        }
        if let Some(provider) = &ctx.provider {
            map.insert("provider".into(), Value::String(provider.id.clone()));
        }
        let now = self.clock.now();
        if let Some(token) = ctx.session_token_valid_for(now, self.settings.session_token_margin) {
            map.insert("session_token".into(), Value::String(token.to_string()));
        }
        Ok(Value::Object(map))
    }

    async fn dispatch(
        &self,
        name: &str,
        tool: &Arc<dyn Tool>,
        args: Value,
        ctx: &SessionContext,
    ) -> Dispatched {
        let per_attempt = tool.timeout().unwrap_or(self.settings.default_timeout);
        let policy = self.retry.clone().capped(tool.max_attempts());

        if let Some(ttl) = tool.cache_ttl() {
            let key = cache_key(name, &args);
            let counter = Arc::new(AtomicU32::new(0));
            let seen = Arc::clone(&counter);
            let run = run_attempts(Arc::clone(tool), name.to_string(), args, policy, per_attempt);
            let compute = async move {
                let attempted = run.await;
                seen.store(attempted.attempts, Ordering::SeqCst);
                attempted.result
            };
            let meta = CacheMeta {
                tool: Some(name.to_string()),
                ttl: Some(ttl),
            };
            let (result, hit) = self.cache.get_or_compute(&key, meta, compute).await;
            return Dispatched {
                result,
                attempts: counter.load(Ordering::SeqCst),
                cache_hit: hit,
                cache_key: Some(key),
            };
        }

        let run = run_attempts(Arc::clone(tool), name.to_string(), args, policy, per_attempt);
        let attempted = if tool.opens_session() {
            let key = (
                ctx.user_id.clone().unwrap_or_default(),
                ctx.provider.as_ref().map(|p| p.id.clone()).unwrap_or_default(),
            );
            self.sessions.run(key, run).await
        } else {
            run.await
        };
        Dispatched {
            result: attempted.result,
            attempts: attempted.attempts,
            cache_hit: false,
            cache_key: None,
        }
    }

    /// 成功响应中带有新的 session_token 时写回上下文
    fn write_back_session(&self, value: &Value, ctx: &mut SessionContext) {
        let Some(token) = value.get("session_token").and_then(Value::as_str) else {
            return;
        };
        let now = self.clock.now();
        let expires_at = value
            .get("session_token_expires_at")
            .and_then(parse_timestamp)
            .or_else(|| {
                value
                    .get("expires_in")
                    .and_then(Value::as_i64)
                    .map(|secs| now + chrono::Duration::seconds(secs))
            })
            .unwrap_or(now + self.settings.session_token_ttl);
        ctx.session_token = Some(token.to_string());
        ctx.session_token_expires_at = Some(expires_at);
        tracing::debug!(session = %ctx.session_id, %expires_at, "session token refreshed");
    }

    fn finish(
        &self,
        tool: &str,
        preview: &str,
        result: &Result<Value, ToolError>,
        attempts: u32,
        cache_hit: bool,
        start: Instant,
    ) {
        let elapsed = start.elapsed();
        let (ok, outcome) = match result {
            Ok(_) => (true, "ok".to_string()),
            Err(ToolError::UnknownTool(_)) => (false, "unknown_tool".to_string()),
            Err(ToolError::Transient { .. }) => (false, "transient".to_string()),
            Err(ToolError::Authorization { .. }) => (false, "authorization".to_string()),
            Err(ToolError::Authz(_)) => (false, "mandate".to_string()),
            Err(ToolError::Business { kind, .. }) => (false, format!("business:{}", kind.as_str())),
        };
        let duration_ms = elapsed.as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool,
            "ok": ok,
            "outcome": outcome,
            "attempts": attempts,
            "cache_hit": cache_hit,
            "duration_ms": duration_ms,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let failure = result.as_ref().err().map(ToolError::failure_kind);
        self.stats
            .record(tool, failure, attempts, cache_hit, elapsed.as_secs_f64() * 1000.0);
    }
}

/// 有界重试循环：每次尝试带超时，仅瞬时失败沿退避表重试
async fn run_attempts(
    tool: Arc<dyn Tool>,
    name: String,
    args: Value,
    policy: RetryPolicy,
    per_attempt: Duration,
) -> Attempted {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(per_attempt, tool.execute(args.clone())).await {
            Err(_) => Outcome::Transient(format!("timed out after {}ms", per_attempt.as_millis())),
            Ok(Err(e)) => classify_transport(&e),
            Ok(Ok(value)) => classify_response(value),
        };

        let result = match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Transient(detail) => {
                if let Some(delay) = policy.delay_after(attempt) {
                    tracing::warn!(
                        tool = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        detail = %sanitize_detail(&detail),
                        "transient tool failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(ToolError::Transient {
                    tool: name,
                    attempts: attempt,
                    detail: sanitize_detail(&detail),
                })
            }
            Outcome::Authorization(detail) => Err(ToolError::Authorization {
                tool: name,
                detail: sanitize_detail(&detail),
            }),
            Outcome::Business { kind, message } => Err(ToolError::Business {
                tool: name,
                kind,
                message: sanitize_detail(&message),
            }),
        };
        return Attempted {
            result,
            attempts: attempt,
        };
    }
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailureKind, ManualClock};
    use crate::mandate::{Capability, HmacSigner, MandatePolicy};
    use crate::session::ProviderRef;
    use crate::tools::outcome::TransportError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// 按脚本依次返回结果的假工具，记录每次收到的参数
    struct Scripted {
        name: &'static str,
        caps: &'static [Capability],
        ttl: Option<chrono::Duration>,
        session: bool,
        script: Mutex<Vec<Result<Value, TransportError>>>,
        seen: Mutex<Vec<Value>>,
        delay: Duration,
        timeout: Option<Duration>,
    }

    impl Scripted {
        fn new(name: &'static str, script: Vec<Result<Value, TransportError>>) -> Self {
            Self {
                name,
                caps: &[],
                ttl: None,
                session: false,
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
                timeout: None,
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Tool for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "scripted"
        }
        fn required_capabilities(&self) -> &'static [Capability] {
            self.caps
        }
        fn cache_ttl(&self) -> Option<chrono::Duration> {
            self.ttl
        }
        fn opens_session(&self) -> bool {
            self.session
        }
        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }
        async fn execute(&self, args: Value) -> Result<Value, TransportError> {
            self.seen.lock().unwrap().push(args);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().cloned().unwrap_or(Ok(json!({})))
            }
        }
    }

    /// 让 Arc<Scripted> 可以注册并在测试中继续观察
    struct Shared(Arc<Scripted>);

    #[async_trait]
    impl Tool for Shared {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn description(&self) -> &str {
            self.0.description()
        }
        fn required_capabilities(&self) -> &'static [Capability] {
            self.0.required_capabilities()
        }
        fn cache_ttl(&self) -> Option<chrono::Duration> {
            self.0.cache_ttl()
        }
        fn opens_session(&self) -> bool {
            self.0.opens_session()
        }
        fn timeout(&self) -> Option<Duration> {
            self.0.timeout()
        }
        async fn execute(&self, args: Value) -> Result<Value, TransportError> {
            self.0.execute(args).await
        }
    }

    fn gateway(tools: Vec<Arc<Scripted>>, clock: Arc<ManualClock>) -> ToolGateway {
        let mut registry = ToolRegistry::new();
        for t in tools {
            registry.register(Shared(t));
        }
        let authority = Arc::new(MandateAuthority::new(
            Arc::new(HmacSigner::new(b"test-key".to_vec())),
            clock.clone(),
            MandatePolicy::default(),
        ));
        let cache = Arc::new(ResultCache::new(
            clock.clone(),
            chrono::Duration::minutes(15),
            chrono::Duration::hours(24),
        ));
        ToolGateway::new(registry, authority, cache, clock).with_retry(RetryPolicy::from_millis(&[1, 1]))
    }

    fn ctx(clock: &ManualClock) -> SessionContext {
        let mut ctx = SessionContext::new("s1", Some("u1".into()), clock.now());
        ctx.provider = Some(ProviderRef {
            id: "acme".into(),
            name: "Acme".into(),
            org_ref: None,
        });
        ctx
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_retried() {
        let clock = Arc::new(ManualClock::default());
        let gw = gateway(vec![], clock.clone());
        let mut c = ctx(&clock);
        let err = gw.invoke("nope", json!({}), &mut c).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool_routes_to_fallback() {
        let clock = Arc::new(ManualClock::default());
        let fallback = Arc::new(Scripted::new("help", vec![Ok(json!({"message": "try again"}))]));
        let gw = gateway(vec![fallback.clone()], clock.clone()).with_fallback("help");
        let mut c = ctx(&clock);
        let out = gw.invoke("acme_teleport", json!({}), &mut c).await.unwrap();
        assert_eq!(out["message"], "try again");
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_success_false_is_business_failure_without_retry() {
        let clock = Arc::new(ManualClock::default());
        let tool = Arc::new(Scripted::new(
            "acme_register",
            vec![Ok(json!({"success": false, "error": "Program is full"}))],
        ));
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);
        let err = gw.invoke("acme_register", json!({}), &mut c).await.unwrap_err();
        assert!(matches!(err, ToolError::Business { kind: FailureKind::ProgramFull, .. }));
        assert_eq!(tool.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_along_backoff_table() {
        let clock = Arc::new(ManualClock::default());
        let tool = Arc::new(Scripted::new(
            "acme_check_availability",
            vec![
                Err(TransportError::Status { status: 503, body: String::new() }),
                Err(TransportError::Timeout),
                Ok(json!({"available": true})),
            ],
        ));
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);
        let out = gw.invoke("acme_check_availability", json!({}), &mut c).await.unwrap();
        assert_eq!(out["available"], true);
        assert_eq!(tool.calls(), 3);
        assert_eq!(gw.stats().snapshot("acme_check_availability").unwrap().retries, 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let clock = Arc::new(ManualClock::default());
        let tool = Arc::new(Scripted::new("flaky", vec![Err(TransportError::Network("reset".into()))]));
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);
        let err = gw.invoke("flaky", json!({}), &mut c).await.unwrap_err();
        assert!(matches!(err, ToolError::Transient { attempts: 3, .. }));
        assert_eq!(tool.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_tool_times_out_and_surfaces_as_transient() {
        let clock = Arc::new(ManualClock::default());
        let mut scripted = Scripted::new("acme_check_availability", vec![Ok(json!({"available": true}))]);
        scripted.delay = Duration::from_secs(1);
        scripted.timeout = Some(Duration::from_millis(50));
        let tool = Arc::new(scripted);
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);

        let started = tokio::time::Instant::now();
        let err = gw
            .invoke("acme_check_availability", json!({}), &mut c)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Transient { attempts: 3, .. }), "{err:?}");
        assert_eq!(tool.calls(), 3);
        assert!(started.elapsed() < Duration::from_secs(1), "each attempt was cut off");
        let stats = gw.stats().snapshot("acme_check_availability").unwrap();
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test]
    async fn test_protected_tool_gets_mandate_and_session_token() {
        let clock = Arc::new(ManualClock::default());
        let mut scripted = Scripted::new("acme_find_programs", vec![Ok(json!({"programs": []}))]);
        scripted.caps = &[Capability::Read];
        let tool = Arc::new(scripted);
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);
        c.session_token = Some("tok".into());
        c.session_token_expires_at = Some(clock.now() + chrono::Duration::minutes(10));

        gw.invoke("acme_find_programs", json!({"category": "ski"}), &mut c).await.unwrap();
        let seen = tool.seen.lock().unwrap()[0].clone();
        assert_eq!(seen["subject"], "u1");
        assert_eq!(seen["provider"], "acme");
        assert_eq!(seen["session_token"], "tok");
        assert!(seen["mandate"]["signature"].is_string());
        assert!(c.mandate.is_some());
    }

    #[tokio::test]
    async fn test_near_expiry_session_token_not_injected() {
        let clock = Arc::new(ManualClock::default());
        let mut scripted = Scripted::new("acme_find_programs", vec![Ok(json!({}))]);
        scripted.caps = &[Capability::Read];
        let tool = Arc::new(scripted);
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);
        c.session_token = Some("tok".into());
        c.session_token_expires_at = Some(clock.now() + chrono::Duration::seconds(20));

        gw.invoke("acme_find_programs", json!({}), &mut c).await.unwrap();
        assert!(tool.seen.lock().unwrap()[0].get("session_token").is_none());
    }

    #[tokio::test]
    async fn test_missing_subject_is_authz_error() {
        let clock = Arc::new(ManualClock::default());
        let mut scripted = Scripted::new("acme_register", vec![Ok(json!({}))]);
        scripted.caps = &[Capability::Register];
        let tool = Arc::new(scripted);
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);
        c.user_id = None;
        let err = gw.invoke("acme_register", json!({}), &mut c).await.unwrap_err();
        assert!(matches!(err, ToolError::Authz(AuthzError::MissingSubject)));
        assert_eq!(tool.calls(), 0);
    }

    #[tokio::test]
    async fn test_authorization_failure_refreshes_exactly_once() {
        let clock = Arc::new(ManualClock::default());
        let mut scripted = Scripted::new(
            "acme_register",
            vec![
                Ok(json!({"success": false, "error": "mandate expired", "code": "authorization_failed"})),
                Ok(json!({"success": true, "registration_id": "r1"})),
            ],
        );
        scripted.caps = &[Capability::Register];
        let tool = Arc::new(scripted);
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);

        let out = gw.invoke("acme_register", json!({}), &mut c).await.unwrap();
        assert_eq!(out["registration_id"], "r1");
        assert_eq!(tool.calls(), 2);
        assert_eq!(gw.authority().issued_count(), 2);

        let seen = tool.seen.lock().unwrap();
        assert_ne!(seen[0]["mandate"]["id"], seen[1]["mandate"]["id"]);
    }

    #[tokio::test]
    async fn test_repeated_authorization_failure_surfaces() {
        let clock = Arc::new(ManualClock::default());
        let mut scripted = Scripted::new(
            "acme_register",
            vec![Err(TransportError::Status { status: 401, body: String::new() })],
        );
        scripted.caps = &[Capability::Register];
        let tool = Arc::new(scripted);
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);
        let err = gw.invoke("acme_register", json!({}), &mut c).await.unwrap_err();
        assert!(matches!(err, ToolError::Authorization { .. }));
        assert_eq!(tool.calls(), 2);
    }

    #[tokio::test]
    async fn test_cacheable_tool_hits_cache() {
        let clock = Arc::new(ManualClock::default());
        let mut scripted = Scripted::new("provider_search", vec![Ok(json!({"providers": ["acme"]}))]);
        scripted.ttl = Some(chrono::Duration::minutes(10));
        let tool = Arc::new(scripted);
        let gw = gateway(vec![tool.clone()], clock.clone());
        let mut c = ctx(&clock);

        gw.invoke("provider_search", json!({"query": "ski"}), &mut c).await.unwrap();
        let again = gw.invoke("provider_search", json!({"query": "ski"}), &mut c).await.unwrap();
        assert_eq!(again["providers"][0], "acme");
        assert_eq!(tool.calls(), 1);
        assert_eq!(c.cache_keys.len(), 1);

        clock.advance(chrono::Duration::minutes(11));
        gw.invoke("provider_search", json!({"query": "ski"}), &mut c).await.unwrap();
        assert_eq!(tool.calls(), 2);
    }

    #[tokio::test]
    async fn test_session_opening_calls_coalesce_per_principal() {
        let clock = Arc::new(ManualClock::default());
        let mut scripted = Scripted::new(
            "acme_login",
            vec![Ok(json!({"success": true, "session_token": "fresh", "expires_in": 600}))],
        );
        scripted.caps = &[Capability::Authenticate];
        scripted.session = true;
        scripted.delay = Duration::from_millis(50);
        let tool = Arc::new(scripted);
        let gw = Arc::new(gateway(vec![tool.clone()], clock.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gw = Arc::clone(&gw);
            let mut c = ctx(&clock);
            handles.push(tokio::spawn(async move {
                let out = gw.invoke("acme_login", json!({}), &mut c).await.unwrap();
                (out, c.session_token.clone())
            }));
        }
        for h in handles {
            let (out, token) = h.await.unwrap();
            assert_eq!(out["session_token"], "fresh");
            assert_eq!(token.as_deref(), Some("fresh"));
        }
        assert_eq!(tool.calls(), 1);
        assert_eq!(gw.session_executions(), 1);
    }

    #[tokio::test]
    async fn test_session_token_write_back_uses_expiry() {
        let clock = Arc::new(ManualClock::default());
        let tool = Arc::new(Scripted::new(
            "acme_ping",
            vec![Ok(json!({"session_token": "t2", "expires_in": 120}))],
        ));
        let gw = gateway(vec![tool], clock.clone());
        let mut c = ctx(&clock);
        gw.invoke("acme_ping", json!({}), &mut c).await.unwrap();
        assert_eq!(c.session_token.as_deref(), Some("t2"));
        assert_eq!(c.session_token_expires_at, Some(clock.now() + chrono::Duration::seconds(120)));
    }
}
