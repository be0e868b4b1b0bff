//! 集成测试共用：可编排的假 provider 工具与引擎组装

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use signup_pilot::config::AppConfig;
use signup_pilot::core::{Engine, EngineBuilder, ManualClock};
use signup_pilot::discovery::{ScriptedForm, ScriptedFormFactory};
use signup_pilot::mandate::{Capability, HmacSigner};
use signup_pilot::session::ProviderRef;
use signup_pilot::tools::{Operation, Tool, TransportError};

pub const PROVIDER: &str = "acme";

/// 按脚本依次返回结果，脚本用完后一直返回最后一项
pub struct FakeTool {
    name: String,
    operation: Option<Operation>,
    script: Mutex<VecDeque<Result<Value, TransportError>>>,
    last: Mutex<Option<Result<Value, TransportError>>>,
    calls: AtomicUsize,
    args: Mutex<Vec<Value>>,
}

impl FakeTool {
    pub fn op(operation: Operation, script: Vec<Result<Value, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            name: operation.tool_name(PROVIDER),
            operation: Some(operation),
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            args: Mutex::new(Vec::new()),
        })
    }

    pub fn ok(operation: Operation, reply: Value) -> Arc<Self> {
        Self::op(operation, vec![Ok(reply)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_args(&self) -> Option<Value> {
        self.args.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Tool for FakeTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "fake provider tool"
    }

    fn required_capabilities(&self) -> &'static [Capability] {
        self.operation.map(Operation::required_capabilities).unwrap_or(&[])
    }

    fn cache_ttl(&self) -> Option<chrono::Duration> {
        self.operation.and_then(Operation::cache_ttl)
    }

    fn opens_session(&self) -> bool {
        self.operation.map(Operation::opens_session).unwrap_or(false)
    }

    async fn execute(&self, args: Value) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.args.lock().unwrap().push(args);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(r) => {
                *self.last.lock().unwrap() = Some(r.clone());
                r
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Ok(json!({"success": true}))),
        }
    }
}

/// 一个 provider 的全套假工具，默认全部成功
pub struct Provider {
    pub search: Arc<FakeTool>,
    pub login: Arc<FakeTool>,
    pub programs: Arc<FakeTool>,
    pub prerequisites: Arc<FakeTool>,
    pub availability: Arc<FakeTool>,
    pub register: Arc<FakeTool>,
}

impl Default for Provider {
    fn default() -> Self {
        Self {
            search: FakeTool::ok(
                Operation::ProviderSearch,
                json!({"providers": [
                    {"id": PROVIDER, "name": "Acme Club", "org_ref": "acme-ski", "location": "Denver"},
                    {"id": "acme-west", "name": "Acme Club West"}
                ]}),
            ),
            login: FakeTool::ok(
                Operation::Login,
                json!({"success": true, "session_token": "sess-1", "expires_in": 1800}),
            ),
            programs: FakeTool::ok(
                Operation::FindPrograms,
                json!({"programs": [
                    {"id": "p1", "title": "Ski Level 1", "price_cents": 15000, "schedule": "Saturdays"},
                    {"id": "p2", "title": "Ski Level 2", "price_cents": 18000}
                ]}),
            ),
            prerequisites: FakeTool::ok(
                Operation::CheckPrerequisites,
                json!({"prerequisites": [{"name": "membership", "passed": true}]}),
            ),
            availability: FakeTool::ok(Operation::CheckAvailability, json!({"available": true})),
            register: FakeTool::ok(
                Operation::Register,
                json!({"success": true, "registration_id": "R-100"}),
            ),
        }
    }
}

impl Provider {
    fn tools(&self) -> Vec<Arc<FakeTool>> {
        vec![
            self.search.clone(),
            self.login.clone(),
            self.programs.clone(),
            self.prerequisites.clone(),
            self.availability.clone(),
            self.register.clone(),
        ]
    }
}

/// 两个必填字段（email、age）且没有成功路径的表单
pub fn email_age_form() -> ScriptedForm {
    ScriptedForm::new()
        .input("email", "email")
        .input("age", "number")
        .errors(&[("email", "Email is required"), ("age", "Age is required")])
}

pub struct Harness {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub forms: Arc<ScriptedFormFactory>,
}

pub async fn harness(provider: &Provider) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
    let forms = Arc::new(ScriptedFormFactory::new(email_age_form));

    let mut config = AppConfig::default();
    config.gateway.backoff_ms = vec![1, 1];
    config.discovery.form_url_template = Some("https://forms.test/{org_ref}/register".into());

    let mut builder = EngineBuilder::new(config)
        .with_clock(clock.clone())
        .with_signer(Arc::new(HmacSigner::new(b"integration-key".to_vec())))
        .with_surfaces(forms.clone());
    for tool in provider.tools() {
        builder = builder.with_tool(tool);
    }
    Harness {
        engine: builder.build().await.unwrap(),
        clock,
        forms,
    }
}

pub fn acme() -> ProviderRef {
    ProviderRef {
        id: PROVIDER.into(),
        name: "Acme Club".into(),
        org_ref: Some("acme-ski".into()),
    }
}
