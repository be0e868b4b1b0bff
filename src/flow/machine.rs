//! 流程状态机
//!
//! 每轮对话：
//! 1. 读取（或惰性创建）会话上下文，先应用按钮动作产生的变更
//! 2. route 得到步骤，调用处理器；处理器要求推进时以空消息继续下一步，最多 max_chain 次
//! 3. 处理器失败：交给 RecoveryEngine 生成可恢复响应，该处理器的变更不应用（网关对委托 / 令牌的修改保留）
//! 4. 按版本号写回；冲突时读取最新上下文，按顺序重放本轮的全部变更，有限次重试
//! 5. 文本交给 Narrator 润色，失败时用草稿
//!
//! 读取或写回上下文失败（含冲突重放次数用尽）时本轮不生效，返回带「重试」按钮的通用道歉。

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::actions::FlowAction;
use super::handlers::StepHandlers;
use super::narrator::Narrator;
use super::response::{recovery_buttons, updates_map, Button, Card, ResponseEnvelope};
use super::step::{route, Step};
use crate::core::{Clock, FlowError, RecoveryAction, RecoveryEngine, StoreError};
use crate::mandate::SignedMandate;
use crate::session::{ContextUpdate, SessionContext, SessionStore};

/// 一轮输入：文本消息，或按钮动作（可同时带文本）
#[derive(Debug, Clone)]
pub struct Turn {
    pub session_id: String,
    pub user_id: Option<String>,
    pub message: String,
    pub action: Option<FlowAction>,
}

impl Turn {
    pub fn message(session_id: impl Into<String>, user_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.map(str::to_string),
            message: message.into(),
            action: None,
        }
    }

    pub fn action(session_id: impl Into<String>, user_id: Option<&str>, action: FlowAction) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.map(str::to_string),
            message: String::new(),
            action: Some(action),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// 单轮内自动推进的最大步数
    pub max_chain: usize,
    /// 版本冲突后的重放次数
    pub max_conflict_retries: usize,
    /// 同一步骤连续失败达到该次数后建议联系支持
    pub max_step_retries: u32,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            max_chain: 4,
            max_conflict_retries: 3,
            max_step_retries: 3,
        }
    }
}

/// 网关在处理器执行期间可能修改的字段
struct GatewayState {
    mandate: Option<SignedMandate>,
    session_token: Option<String>,
    session_token_expires_at: Option<DateTime<Utc>>,
    cache_keys: usize,
}

impl GatewayState {
    fn capture(ctx: &SessionContext) -> Self {
        Self {
            mandate: ctx.mandate.clone(),
            session_token: ctx.session_token.clone(),
            session_token_expires_at: ctx.session_token_expires_at,
            cache_keys: ctx.cache_keys.len(),
        }
    }

    /// 把网关的修改记成变更，冲突重放时与处理器变更保持原有顺序
    fn delta(&self, ctx: &SessionContext) -> Vec<ContextUpdate> {
        let mut out = Vec::new();
        if self.mandate != ctx.mandate {
            out.push(ContextUpdate::Mandate(ctx.mandate.clone()));
        }
        if self.session_token != ctx.session_token || self.session_token_expires_at != ctx.session_token_expires_at {
            out.push(ContextUpdate::SessionToken {
                token: ctx.session_token.clone(),
                expires_at: ctx.session_token_expires_at,
            });
        }
        out.extend(
            ctx.cache_keys
                .iter()
                .skip(self.cache_keys)
                .cloned()
                .map(ContextUpdate::RecordCacheKey),
        );
        out
    }
}

/// 一轮处理的结果（润色与持久化之前）
struct TurnOutcome {
    step: Step,
    drafts: Vec<String>,
    cards: Vec<Card>,
    cta: Vec<Button>,
    recovery: Option<RecoveryAction>,
}

pub struct FlowMachine {
    store: Arc<dyn SessionStore>,
    handlers: StepHandlers,
    narrator: Narrator,
    recovery: RecoveryEngine,
    clock: Arc<dyn Clock>,
    settings: FlowSettings,
}

impl FlowMachine {
    pub fn new(store: Arc<dyn SessionStore>, handlers: StepHandlers, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            handlers,
            narrator: Narrator::plain(),
            recovery: RecoveryEngine::new(),
            clock,
            settings: FlowSettings::default(),
        }
    }

    pub fn with_narrator(mut self, narrator: Narrator) -> Self {
        self.narrator = narrator;
        self
    }

    pub fn with_settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn handlers(&self) -> &StepHandlers {
        &self.handlers
    }

    /// 处理一轮输入；总会返回响应
    pub async fn handle(&self, turn: Turn) -> ResponseEnvelope {
        let mut ctx = match self.store.get(&turn.session_id).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => {
                tracing::info!(session = %turn.session_id, "creating session context");
                SessionContext::new(turn.session_id.clone(), turn.user_id.clone(), self.clock.now())
            }
            Err(e) => {
                // 读不到上下文时按新会话的入口步骤回复
                let blank = SessionContext::new(turn.session_id.clone(), turn.user_id.clone(), self.clock.now());
                return self.turn_failed(&turn, route(&turn.message, &blank), e.into());
            }
        };
        if ctx.user_id.is_none() {
            ctx.user_id = turn.user_id.clone();
        }

        let mut applied = Vec::new();
        let outcome = self.run_turn(&turn, &mut ctx, &mut applied).await;
        if let Err(e) = self.persist(ctx, &applied).await {
            return self.turn_failed(&turn, outcome.step, e);
        }

        let draft = outcome.drafts.join("\n\n");
        if draft.trim().is_empty() {
            tracing::warn!(session = %turn.session_id, step = %outcome.step, "step produced an empty message");
        }
        let message = self.narrator.polish(outcome.step, &draft).await;

        ResponseEnvelope {
            message,
            cards: outcome.cards,
            cta: outcome.cta,
            context_updates: updates_map(&applied),
            step: outcome.step,
            recovery: outcome.recovery,
        }
    }

    /// 本轮未能保存：不报告任何变更，只给恢复提示
    fn turn_failed(&self, turn: &Turn, step: Step, err: FlowError) -> ResponseEnvelope {
        let recovery = self.recovery.handle(&err);
        tracing::error!(
            session = %turn.session_id,
            step = %step,
            kind = recovery.kind.as_str(),
            "turn could not be stored"
        );
        ResponseEnvelope {
            message: recovery.message,
            cards: Vec::new(),
            cta: recovery_buttons(recovery.action),
            context_updates: updates_map(&[]),
            step,
            recovery: Some(recovery.action),
        }
    }

    async fn run_turn(&self, turn: &Turn, ctx: &mut SessionContext, applied: &mut Vec<ContextUpdate>) -> TurnOutcome {
        if let Some(action) = &turn.action {
            tracing::info!(session = %turn.session_id, action = action.name(), "button action");
            self.apply(ctx, applied, action.to_updates());
        }

        let mut message = turn.message.as_str();
        let mut action = turn.action.as_ref();
        let mut drafts = Vec::new();
        let mut chained = 0;

        loop {
            let step = route(message, ctx);
            let before = GatewayState::capture(ctx);
            let result = self.handlers.handle(step, message, action, ctx).await;
            let gateway = before.delta(ctx);
            applied.extend(gateway);

            match result {
                Ok(response) => {
                    let mut updates = response.updates;
                    if ctx.retry_counts.contains_key(step.as_str()) {
                        updates.push(ContextUpdate::ResetRetry(step.as_str().to_string()));
                    }
                    updates.push(ContextUpdate::CurrentStep(step));
                    self.apply(ctx, applied, updates);
                    drafts.push(response.message);

                    let next = route("", ctx);
                    if response.advance && chained < self.settings.max_chain && next != step {
                        tracing::debug!(from = %step, to = %next, "advancing");
                        chained += 1;
                        message = "";
                        action = None;
                        continue;
                    }
                    return TurnOutcome {
                        step,
                        drafts,
                        cards: response.cards,
                        cta: response.cta,
                        recovery: None,
                    };
                }
                Err(err) => {
                    let mut recovery = self.recovery.handle(&err);
                    let key = step.as_str().to_string();
                    self.apply(
                        ctx,
                        applied,
                        vec![ContextUpdate::BumpRetry(key.clone()), ContextUpdate::CurrentStep(step)],
                    );
                    let failures = ctx.retry_counts.get(&key).copied().unwrap_or(0);
                    if failures >= self.settings.max_step_retries && recovery.action == RecoveryAction::Retry {
                        recovery.action = RecoveryAction::ContactSupport;
                    }
                    tracing::info!(
                        session = %turn.session_id,
                        step = %step,
                        kind = recovery.kind.as_str(),
                        failures,
                        "step failed, offering recovery"
                    );
                    drafts.push(recovery.message);
                    return TurnOutcome {
                        step,
                        drafts,
                        cards: Vec::new(),
                        cta: recovery_buttons(recovery.action),
                        recovery: Some(recovery.action),
                    };
                }
            }
        }
    }

    fn apply(&self, ctx: &mut SessionContext, applied: &mut Vec<ContextUpdate>, updates: Vec<ContextUpdate>) {
        ctx.apply_all(&updates, self.clock.now());
        applied.extend(updates);
    }

    /// 版本冲突时在最新上下文上重放本轮变更
    async fn persist(&self, mut ctx: SessionContext, applied: &[ContextUpdate]) -> Result<SessionContext, FlowError> {
        let mut conflicts = 0;
        loop {
            match self.store.set(&ctx).await {
                Ok(version) => {
                    ctx.version = version;
                    return Ok(ctx);
                }
                Err(StoreError::Conflict { expected, found, .. }) if conflicts < self.settings.max_conflict_retries => {
                    conflicts += 1;
                    tracing::warn!(
                        session = %ctx.session_id,
                        expected,
                        found,
                        attempt = conflicts,
                        "context version conflict, replaying turn updates"
                    );
                    let mut fresh = match self.store.get(&ctx.session_id).await? {
                        Some(fresh) => fresh,
                        None => SessionContext::new(ctx.session_id.clone(), ctx.user_id.clone(), ctx.created_at),
                    };
                    if fresh.user_id.is_none() {
                        fresh.user_id = ctx.user_id.clone();
                    }
                    fresh.apply_all(applied, self.clock.now());
                    ctx = fresh;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
