//! 字段探测循环
//!
//! 每轮：用合成值填充可见输入 → 点击第一个可见的提交按钮 → 出现成功文本则结束，
//! 否则收集可见的校验错误，把未见过的字段加入集合；本轮没有新字段即到达不动点。
//! 轮数不超过 max_loops，总耗时不超过 run_budget_secs，字段集合只增不减。
//! 页面操作中途失败时，已经找到的字段照常返回，置信度降低。

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::field::{DiscoveredField, FieldMap, FieldType};
use super::heuristics::{humanize, identity_from_attrs, identity_from_message, infer_type, is_editable};
use super::surface::{ElementHandle, FormSurface};
use crate::core::SurfaceError;

/// 探测配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub max_loops: u32,
    pub input_selector: String,
    /// 按优先级排列
    pub submit_selectors: Vec<String>,
    pub error_selectors: Vec<String>,
    /// 成功文本正则（不区分大小写）
    pub success_patterns: Vec<String>,
    pub page_selector: String,
    /// 参数未给出 url 时使用；支持 {provider} / {org_ref} 占位符
    pub form_url_template: Option<String>,
    pub timeout_secs: u64,
    /// 整次探测的时间预算；到期后不再开始新一轮
    pub run_budget_secs: u64,
    pub cache_ttl_secs: i64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_loops: 10,
            input_selector: "input, textarea".to_string(),
            submit_selectors: vec![
                "button[type=submit]".to_string(),
                "input[type=submit]".to_string(),
                "button.submit, .btn-submit".to_string(),
                "form button".to_string(),
            ],
            error_selectors: vec![
                ".error, .field-error, .invalid-feedback".to_string(),
                "[role=alert]".to_string(),
                "[aria-invalid=true]".to_string(),
            ],
            success_patterns: vec![
                r"thank you".to_string(),
                r"registration (is )?complete".to_string(),
                r"successfully (registered|submitted)".to_string(),
                r"confirmation (number|code)".to_string(),
            ],
            page_selector: "body".to_string(),
            form_url_template: None,
            timeout_secs: 300,
            run_budget_secs: 240,
            cache_ttl_secs: 3600,
        }
    }
}

/// 结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Success,
    MaxLoops,
    /// 不动点：本轮没有新的校验错误
    NoNewErrors,
    /// 找不到可见的提交按钮
    NoSubmitAffordance,
    /// 时间预算用完
    BudgetExhausted,
    /// 页面操作失败，结果只含失败前找到的字段
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub max_loops_reached: bool,
    pub success_detected: bool,
    pub errors_found: usize,
    #[serde(default)]
    pub interrupted: bool,
}

/// 一次探测的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRun {
    pub fields: Vec<DiscoveredField>,
    pub loops: u32,
    pub confidence: f64,
    pub termination: Termination,
    pub metadata: RunMetadata,
    /// 每轮结束时的字段数
    pub field_counts: Vec<usize>,
}

/// 中途失败时在常规置信度上扣除的值
const INTERRUPTED_PENALTY: f64 = 0.2;

/// 成功 1.0；否则有字段 0.7，无字段 0.3，上限 0.95
pub fn confidence(success: bool, field_count: usize) -> f64 {
    if success {
        return 1.0;
    }
    let base = if field_count > 0 { 0.7 } else { 0.3 };
    f64::min(0.95, base)
}

fn run_confidence(termination: Termination, field_count: usize) -> f64 {
    let base = confidence(termination == Termination::Success, field_count);
    if termination == Termination::Interrupted {
        (base - INTERRUPTED_PENALTY).max(0.0)
    } else {
        base
    }
}

pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    success: Vec<Regex>,
}

impl DiscoveryEngine {
    pub fn new(config: DiscoveryConfig) -> Self {
        let success = config
            .success_patterns
            .iter()
            .filter_map(|p| match Regex::new(&format!("(?i){p}")) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "invalid success pattern ignored");
                    None
                }
            })
            .collect();
        Self { config, success }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub async fn run(&self, surface: &dyn FormSurface) -> Result<DiscoveryRun, SurfaceError> {
        let mut fields = FieldMap::new();
        let mut field_counts = Vec::new();
        let mut loops = 0u32;
        let mut termination = Termination::MaxLoops;
        let started = Instant::now();
        let budget = Duration::from_secs(self.config.run_budget_secs);

        while loops < self.config.max_loops {
            if loops > 0 && started.elapsed() >= budget {
                tracing::info!(loops, "discovery budget exhausted");
                termination = Termination::BudgetExhausted;
                break;
            }
            loops += 1;
            let step = self.iterate(surface, &mut fields, loops).await;
            field_counts.push(fields.len());
            match step {
                Ok(Some(done)) => {
                    termination = done;
                    break;
                }
                Ok(None) => {}
                Err(e) if fields.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!(loops, fields = fields.len(), error = %e, "surface failed mid-run, keeping partial fields");
                    termination = Termination::Interrupted;
                    break;
                }
            }
        }

        let success = termination == Termination::Success;
        let run = DiscoveryRun {
            confidence: run_confidence(termination, fields.len()),
            metadata: RunMetadata {
                max_loops_reached: termination == Termination::MaxLoops,
                success_detected: success,
                errors_found: fields.len(),
                interrupted: termination == Termination::Interrupted,
            },
            fields: fields.into_fields(),
            loops,
            termination,
            field_counts,
        };
        tracing::info!(
            loops = run.loops,
            fields = run.fields.len(),
            confidence = run.confidence,
            termination = ?run.termination,
            "discovery finished"
        );
        Ok(run)
    }

    /// 一轮：填充、提交、判断；返回 Some 表示探测结束
    async fn iterate(
        &self,
        surface: &dyn FormSurface,
        fields: &mut FieldMap,
        loops: u32,
    ) -> Result<Option<Termination>, SurfaceError> {
        let filled = self.autofill(surface).await?;

        if !self.submit(surface).await? {
            tracing::info!(loops, "no submit affordance, stopping discovery");
            return Ok(Some(Termination::NoSubmitAffordance));
        }
        if self.success_detected(surface).await? {
            return Ok(Some(Termination::Success));
        }

        let added = self.collect_errors(surface, fields).await?;
        tracing::debug!(loops, filled, added, total = fields.len(), "discovery iteration");
        Ok((added == 0).then_some(Termination::NoNewErrors))
    }

    /// 填充可见的可编辑输入，返回填充数量
    async fn autofill(&self, surface: &dyn FormSurface) -> Result<usize, SurfaceError> {
        let mut filled = 0;
        for el in surface.locate(&self.config.input_selector).await? {
            if !surface.is_visible(&el).await? {
                continue;
            }
            let input_type = surface.attribute(&el, "type").await?;
            let readonly = surface.attribute(&el, "readonly").await?.is_some();
            let disabled = surface.attribute(&el, "disabled").await?.is_some();
            if !is_editable(input_type.as_deref(), readonly, disabled) {
                continue;
            }
            let identity = identity_from_attrs(&[
                surface.attribute(&el, "name").await?,
                surface.attribute(&el, "id").await?,
            ])
            .unwrap_or_default();

            match infer_type(&identity, input_type.as_deref(), None) {
                FieldType::Checkbox => {
                    if surface.attribute(&el, "checked").await?.is_none() {
                        surface.click(&el).await?;
                        filled += 1;
                    }
                }
                ty => {
                    if let Some(value) = ty.synthetic_value() {
                        surface.set_value(&el, value).await?;
                        filled += 1;
                    }
                }
            }
        }
        Ok(filled)
    }

    /// 按优先级点击第一个可见的提交按钮；没有则返回 false
    async fn submit(&self, surface: &dyn FormSurface) -> Result<bool, SurfaceError> {
        for selector in &self.config.submit_selectors {
            for el in surface.locate(selector).await? {
                if surface.is_visible(&el).await? {
                    surface.click(&el).await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn success_detected(&self, surface: &dyn FormSurface) -> Result<bool, SurfaceError> {
        let Some(page) = surface.locate(&self.config.page_selector).await?.into_iter().next() else {
            return Ok(false);
        };
        let text = surface.read_text(&page).await?;
        Ok(self.success.iter().any(|re| re.is_match(&text)))
    }

    /// 收集可见校验错误，返回新增字段数
    async fn collect_errors(
        &self,
        surface: &dyn FormSurface,
        fields: &mut FieldMap,
    ) -> Result<usize, SurfaceError> {
        let mut added = 0;
        for selector in &self.config.error_selectors {
            for el in surface.locate(selector).await? {
                if !surface.is_visible(&el).await? {
                    continue;
                }
                if let Some(field) = self.field_from_error(surface, &el).await? {
                    if fields.insert(field) {
                        added += 1;
                    }
                }
            }
        }
        Ok(added)
    }

    async fn field_from_error(
        &self,
        surface: &dyn FormSurface,
        el: &ElementHandle,
    ) -> Result<Option<DiscoveredField>, SurfaceError> {
        let message = surface.read_text(el).await?.trim().to_string();
        let identity = identity_from_attrs(&[
            surface.attribute(el, "data-field").await?,
            surface.attribute(el, "for").await?,
            surface.attribute(el, "name").await?,
            surface.attribute(el, "id").await?,
        ])
        .or_else(|| identity_from_message(&message));
        let Some(id) = identity else {
            return Ok(None);
        };
        let input_type = surface.attribute(el, "type").await?;

        // 出现校验错误即视为必填
        Ok(Some(DiscoveredField {
            label: humanize(&id),
            field_type: infer_type(&id, input_type.as_deref(), None),
            required: true,
            message: (!message.is_empty()).then_some(message),
            locator: Some(format!("[name=\"{id}\"]")),
            id,
        }))
    }
}
