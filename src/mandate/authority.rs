//! 委托签发与校验
//!
//! ensure_mandate：已有委托覆盖所需能力且剩余有效期 > reuse_margin 时复用；否则签发新委托
//! （scope = required ∪ {authenticate}，窗口 [now, now + ttl]），旧委托在账本中标记为 Superseded。
//! 校验永远从签名声明重新计算 scope 覆盖与时间窗口，不信任未签名的字段。
//! 账本里查不到的委托（进程重启前签发的、或已过期被清理的）一律视为不可用。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::claims::{Capability, MandateClaims, MandateStatus, SignedMandate};
use super::signer::MandateSigner;
use crate::core::{AuthzError, Clock};
use crate::session::SessionContext;

/// 签发策略
#[derive(Debug, Clone)]
pub struct MandatePolicy {
    /// 新委托有效期
    pub ttl: Duration,
    /// 剩余有效期不足该值时不再复用
    pub reuse_margin: Duration,
    /// 未选定课程时的金额上限（分）
    pub default_max_amount_cents: u64,
}

impl Default for MandatePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(5),
            reuse_margin: Duration::seconds(60),
            default_max_amount_cents: 0,
        }
    }
}

/// ensure_mandate 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Reused,
    Issued,
}

/// 签发请求
#[derive(Debug, Clone)]
pub struct MandateRequest {
    pub subject: String,
    pub provider: String,
    pub scope: BTreeSet<Capability>,
    pub program_ref: Option<String>,
    pub max_amount_cents: u64,
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    status: MandateStatus,
    valid_until: DateTime<Utc>,
}

/// 委托签发方：签名器 + 状态账本
pub struct MandateAuthority {
    signer: Arc<dyn MandateSigner>,
    clock: Arc<dyn Clock>,
    policy: MandatePolicy,
    ledger: RwLock<HashMap<Uuid, LedgerEntry>>,
    issued: AtomicU64,
}

impl MandateAuthority {
    pub fn new(signer: Arc<dyn MandateSigner>, clock: Arc<dyn Clock>, policy: MandatePolicy) -> Self {
        Self {
            signer,
            clock,
            policy,
            ledger: RwLock::new(HashMap::new()),
            issued: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &MandatePolicy {
        &self.policy
    }

    /// 累计签发次数
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// 确保上下文中有覆盖 required 的有效委托
    pub async fn ensure_mandate(
        &self,
        ctx: &mut SessionContext,
        required: &[Capability],
    ) -> Result<EnsureOutcome, AuthzError> {
        let subject = ctx.user_id.clone().ok_or(AuthzError::MissingSubject)?;
        let provider = ctx
            .provider
            .as_ref()
            .map(|p| p.id.clone())
            .ok_or(AuthzError::MissingProvider)?;
        let now = self.clock.now();

        if let Some(current) = ctx.mandate.as_ref() {
            let same_principal = current.claims.subject == subject && current.claims.provider == provider;
            match self.check(current, required, now, self.policy.reuse_margin).await {
                Ok(()) if same_principal => {
                    tracing::debug!(mandate = %current.id, "mandate reused");
                    return Ok(EnsureOutcome::Reused);
                }
                Ok(()) => {}
                Err(reason) => {
                    tracing::debug!(mandate = %current.id, %reason, "mandate not reusable");
                }
            }
        }

        let mut scope: BTreeSet<Capability> = required.iter().copied().collect();
        scope.insert(Capability::Authenticate);
        let request = MandateRequest {
            subject,
            provider,
            scope,
            program_ref: ctx.program.as_ref().map(|p| p.id.clone()),
            max_amount_cents: ctx
                .program
                .as_ref()
                .and_then(|p| p.price_cents)
                .unwrap_or(self.policy.default_max_amount_cents),
        };
        let fresh = self.issue(request).await?;

        if let Some(old) = ctx.mandate.replace(fresh) {
            self.set_status(old.id, MandateStatus::Superseded).await;
        }
        Ok(EnsureOutcome::Issued)
    }

    /// 签发新委托
    pub async fn issue(&self, request: MandateRequest) -> Result<SignedMandate, AuthzError> {
        let now = self.clock.now();
        let claims = MandateClaims {
            mandate_id: Uuid::new_v4(),
            subject: request.subject,
            provider: request.provider,
            scope: request.scope,
            program_ref: request.program_ref,
            max_amount_cents: request.max_amount_cents,
            valid_from: now,
            valid_until: now + self.policy.ttl,
        };
        let signature = self.signer.sign(&claims.canonical_bytes())?;
        let mandate = SignedMandate {
            id: claims.mandate_id,
            claims,
            signature,
        };
        {
            let mut ledger = self.ledger.write().await;
            let before = ledger.len();
            ledger.retain(|_, entry| entry.valid_until > now);
            let pruned = before - ledger.len();
            if pruned > 0 {
                tracing::debug!(pruned, "expired mandates dropped from ledger");
            }
            ledger.insert(
                mandate.id,
                LedgerEntry {
                    status: MandateStatus::Active,
                    valid_until: mandate.claims.valid_until,
                },
            );
        }
        self.issued.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            mandate = %mandate.id,
            subject = %mandate.claims.subject,
            provider = %mandate.claims.provider,
            scope = ?mandate.claims.scope,
            valid_until = %mandate.claims.valid_until,
            "mandate issued"
        );
        Ok(mandate)
    }

    /// 校验：签名、状态、scope 覆盖、时间窗口包含 now
    pub async fn verify(&self, mandate: &SignedMandate, required: &[Capability]) -> Result<(), AuthzError> {
        self.check(mandate, required, self.clock.now(), Duration::zero()).await
    }

    /// 下游返回授权失败时调用：吊销当前委托并从上下文移除
    pub async fn invalidate(&self, ctx: &mut SessionContext) {
        if let Some(m) = ctx.mandate.take() {
            self.set_status(m.id, MandateStatus::Revoked).await;
            tracing::info!(mandate = %m.id, "mandate invalidated");
        }
    }

    pub async fn status(&self, id: Uuid) -> Option<MandateStatus> {
        self.ledger.read().await.get(&id).map(|e| e.status)
    }

    /// 账本中仍在跟踪的委托数
    pub async fn ledger_len(&self) -> usize {
        self.ledger.read().await.len()
    }

    async fn set_status(&self, id: Uuid, status: MandateStatus) {
        if let Some(entry) = self.ledger.write().await.get_mut(&id) {
            entry.status = status;
        }
    }

    async fn check(
        &self,
        mandate: &SignedMandate,
        required: &[Capability],
        now: DateTime<Utc>,
        margin: Duration,
    ) -> Result<(), AuthzError> {
        if !self
            .signer
            .verify(&mandate.claims.canonical_bytes(), &mandate.signature)
            || !mandate.id_matches_claims()
        {
            return Err(AuthzError::BadSignature);
        }
        match self.status(mandate.claims.mandate_id).await {
            Some(MandateStatus::Active) => {}
            Some(MandateStatus::Revoked | MandateStatus::Superseded) => return Err(AuthzError::Revoked),
            None => return Err(AuthzError::UnknownMandate),
        }
        let missing = mandate.claims.missing(required);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
            return Err(AuthzError::InsufficientScope(names.join(",")));
        }
        if !mandate.claims.valid_at(now, margin) {
            return Err(AuthzError::Expired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::mandate::HmacSigner;
    use crate::session::ProviderRef;

    fn setup() -> (MandateAuthority, Arc<ManualClock>, SessionContext) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let authority = MandateAuthority::new(
            Arc::new(HmacSigner::new(b"test-key".to_vec())),
            clock.clone(),
            MandatePolicy::default(),
        );
        let mut ctx = SessionContext::new("s1", Some("u1".into()), clock.now());
        ctx.provider = Some(ProviderRef {
            id: "acme".into(),
            name: "Acme Club".into(),
            org_ref: None,
        });
        (authority, clock, ctx)
    }

    #[tokio::test]
    async fn test_missing_subject_or_provider() {
        let (authority, _, mut ctx) = setup();
        ctx.user_id = None;
        assert_eq!(
            authority.ensure_mandate(&mut ctx, &[Capability::Read]).await,
            Err(AuthzError::MissingSubject)
        );
        ctx.user_id = Some("u1".into());
        ctx.provider = None;
        assert_eq!(
            authority.ensure_mandate(&mut ctx, &[Capability::Read]).await,
            Err(AuthzError::MissingProvider)
        );
        assert_eq!(authority.issued_count(), 0);
    }

    #[tokio::test]
    async fn test_issue_adds_authenticate_and_five_minute_window() {
        let (authority, clock, mut ctx) = setup();
        let outcome = authority.ensure_mandate(&mut ctx, &[Capability::Register]).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Issued);
        let m = ctx.mandate.as_ref().unwrap();
        assert!(m.claims.scope.contains(&Capability::Authenticate));
        assert!(m.claims.scope.contains(&Capability::Register));
        assert_eq!(m.claims.valid_until - clock.now(), Duration::minutes(5));
        authority.verify(m, &[Capability::Register]).await.unwrap();
    }

    #[tokio::test]
    async fn test_reuse_when_covering_and_fresh() {
        let (authority, clock, mut ctx) = setup();
        authority.ensure_mandate(&mut ctx, &[Capability::Read, Capability::Register]).await.unwrap();
        let first = ctx.mandate.clone().unwrap();

        clock.advance(Duration::minutes(3));
        let outcome = authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Reused);
        assert_eq!(authority.issued_count(), 1);
        assert_eq!(ctx.mandate.as_ref().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_refresh_near_expiry_supersedes_old() {
        let (authority, clock, mut ctx) = setup();
        authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        let old = ctx.mandate.clone().unwrap();

        // 剩余 60 秒：不满足 > 60s
        clock.advance(Duration::minutes(4));
        let outcome = authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Issued);
        let fresh = ctx.mandate.clone().unwrap();
        assert!(fresh.valid_until() > old.valid_until());
        assert_eq!(authority.status(old.id).await, Some(MandateStatus::Superseded));
        assert_eq!(authority.verify(&old, &[Capability::Read]).await, Err(AuthzError::Revoked));
    }

    #[tokio::test]
    async fn test_scope_growth_triggers_reissue() {
        let (authority, _, mut ctx) = setup();
        authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        let outcome = authority.ensure_mandate(&mut ctx, &[Capability::Pay]).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Issued);
        assert_eq!(authority.issued_count(), 2);
    }

    #[tokio::test]
    async fn test_tampered_scope_fails_signature() {
        let (authority, _, mut ctx) = setup();
        authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        let mut forged = ctx.mandate.clone().unwrap();
        forged.claims.scope.insert(Capability::Pay);
        assert_eq!(
            authority.verify(&forged, &[Capability::Pay]).await,
            Err(AuthzError::BadSignature)
        );

        // 伪造的委托放回上下文也不会被复用
        ctx.mandate = Some(forged);
        let outcome = authority.ensure_mandate(&mut ctx, &[Capability::Pay]).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Issued);
    }

    #[tokio::test]
    async fn test_invalidate_revokes() {
        let (authority, _, mut ctx) = setup();
        authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        let id = ctx.mandate.as_ref().unwrap().id;
        authority.invalidate(&mut ctx).await;
        assert!(ctx.mandate.is_none());
        assert_eq!(authority.status(id).await, Some(MandateStatus::Revoked));
    }

    #[tokio::test]
    async fn test_revoked_mandate_with_swapped_id_is_rejected() {
        let (authority, _, mut ctx) = setup();
        authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        let original = ctx.mandate.clone().unwrap();
        authority.invalidate(&mut ctx).await;
        assert_eq!(authority.verify(&original, &[Capability::Read]).await, Err(AuthzError::Revoked));

        let mut forged = original.clone();
        forged.id = Uuid::new_v4();
        assert_eq!(
            authority.verify(&forged, &[Capability::Read]).await,
            Err(AuthzError::BadSignature)
        );

        ctx.mandate = Some(forged);
        let outcome = authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Issued);
        assert_eq!(authority.issued_count(), 2);
    }

    #[tokio::test]
    async fn test_mandate_unknown_to_ledger_is_reissued() {
        let (authority, clock, mut ctx) = setup();
        authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        let persisted = ctx.mandate.clone().unwrap();

        // 同一密钥的新进程：账本为空
        let restarted = MandateAuthority::new(
            Arc::new(HmacSigner::new(b"test-key".to_vec())),
            clock.clone(),
            MandatePolicy::default(),
        );
        assert_eq!(
            restarted.verify(&persisted, &[Capability::Read]).await,
            Err(AuthzError::UnknownMandate)
        );
        let outcome = restarted.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Issued);
        assert_ne!(ctx.mandate.as_ref().unwrap().id, persisted.id);
    }

    #[tokio::test]
    async fn test_expired_entries_are_pruned_on_issue() {
        let (authority, clock, mut ctx) = setup();
        for _ in 0..4 {
            authority.ensure_mandate(&mut ctx, &[Capability::Read]).await.unwrap();
            clock.advance(Duration::minutes(6));
        }
        assert_eq!(authority.issued_count(), 4);
        assert_eq!(authority.ledger_len().await, 1);
    }

    #[tokio::test]
    async fn test_program_price_caps_amount() {
        let (authority, _, mut ctx) = setup();
        ctx.program = Some(crate::session::ProgramRef {
            id: "p1".into(),
            title: "Ski".into(),
            price_cents: Some(12_500),
        });
        authority.ensure_mandate(&mut ctx, &[Capability::Pay]).await.unwrap();
        let claims = &ctx.mandate.as_ref().unwrap().claims;
        assert_eq!(claims.max_amount_cents, 12_500);
        assert_eq!(claims.program_ref.as_deref(), Some("p1"));
    }
}
