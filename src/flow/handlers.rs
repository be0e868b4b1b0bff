//! 步骤处理器
//!
//! 每个步骤一个处理器：读取上下文、必要时经网关调用工具，返回 StepResponse。
//! 处理器不直接修改上下文字段；网关对委托与会话令牌的修改除外。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::actions::FlowAction;
use super::response::{Button, Card, StepResponse};
use super::step::{wants_provider_change, Step};
use crate::core::{Clock, FailureKind, FlowError, ToolError};
use crate::discovery::{DiscoveredField, FieldType, DISCOVERY_TOOL};
use crate::session::{ContextUpdate, PrerequisiteResult, ProgramRef, ProviderRef, SessionContext};
use crate::tools::{Operation, ToolGateway};

/// 登录步骤复用会话令牌所需的最短剩余有效期
const LOGIN_TOKEN_MARGIN_SECS: i64 = 30;

pub struct StepHandlers {
    gateway: Arc<ToolGateway>,
    clock: Arc<dyn Clock>,
}

impl StepHandlers {
    pub fn new(gateway: Arc<ToolGateway>, clock: Arc<dyn Clock>) -> Self {
        Self { gateway, clock }
    }

    pub fn gateway(&self) -> &Arc<ToolGateway> {
        &self.gateway
    }

    /// `action` 只传给本轮第一个处理器；自动推进的后续步骤收到空消息
    pub async fn handle(
        &self,
        step: Step,
        message: &str,
        action: Option<&FlowAction>,
        ctx: &mut SessionContext,
    ) -> Result<StepResponse, FlowError> {
        tracing::debug!(step = %step, "running step handler");
        match step {
            Step::ProviderSearch => self.provider_search(message, ctx).await,
            Step::Login => self.login(ctx).await,
            Step::IntentCapture => Ok(intent_capture(message, ctx)),
            Step::FieldProbe => self.field_probe(ctx).await,
            Step::ProgramSelection => self.program_selection(message, ctx).await,
            Step::PrerequisiteCheck => self.prerequisite_check(ctx).await,
            Step::FormFill => Ok(form_fill(message, ctx)),
            Step::Confirmation => self.confirmation(message, action, ctx).await,
            Step::Completed => Ok(completed(ctx)),
        }
    }

    async fn provider_search(&self, message: &str, ctx: &mut SessionContext) -> Result<StepResponse, FlowError> {
        let query = message.trim();
        if ctx.provider.is_some() && wants_provider_change(query) {
            return Ok(StepResponse::text("No problem. Which organization would you like to sign up with instead?")
                .with_updates(vec![ContextUpdate::ClearProvider]));
        }
        if query.is_empty() {
            return Ok(StepResponse::text(
                "Which organization would you like to sign up with? Tell me its name and I'll look it up.",
            ));
        }

        let tool = Operation::ProviderSearch.tool_name("");
        let value = self.gateway.invoke(&tool, json!({ "query": query }), ctx).await?;
        let rows: Vec<ProviderRow> = parse_list(&tool, &value, "providers")?;
        let updates = vec![ContextUpdate::ProviderQuery(query.to_string())];

        if rows.is_empty() {
            return Ok(StepResponse::text(format!(
                "I couldn't find a provider matching \"{query}\". Could you try another name?"
            ))
            .with_updates(updates));
        }

        let cards = rows
            .into_iter()
            .map(|row| {
                let subtitle = row.location.clone();
                let provider = ProviderRef {
                    id: row.id,
                    name: row.name.clone(),
                    org_ref: row.org_ref,
                };
                Card {
                    title: row.name,
                    subtitle,
                    buttons: vec![Button::new("Select", FlowAction::SelectProvider(provider))],
                }
            })
            .collect();

        Ok(StepResponse::text("Here's what I found. Which one is yours?")
            .with_cards(cards)
            .with_updates(updates))
    }

    async fn login(&self, ctx: &mut SessionContext) -> Result<StepResponse, FlowError> {
        let provider = provider_of(ctx)?;
        let Some(credential_ref) = ctx.credential_ref.clone() else {
            return Ok(StepResponse::text(format!(
                "To sign up on your behalf I need to connect to your {} account.",
                provider.name
            ))
            .with_cta(vec![Button::new("Connect account", FlowAction::ConnectAccount)]));
        };

        let now = self.clock.now();
        let margin = chrono::Duration::seconds(LOGIN_TOKEN_MARGIN_SECS);
        if ctx.session_token_valid_for(now, margin).is_some() {
            return Ok(StepResponse::text(format!("You're already signed in to {}.", provider.name))
                .with_updates(vec![ContextUpdate::LoginConfirmed(true)])
                .advancing());
        }

        let tool = Operation::Login.tool_name(&provider.id);
        self.gateway
            .invoke(&tool, json!({ "credential_ref": credential_ref }), ctx)
            .await?;
        Ok(StepResponse::text(format!("Signed in to {}.", provider.name))
            .with_updates(vec![ContextUpdate::LoginConfirmed(true)])
            .advancing())
    }

    async fn field_probe(&self, ctx: &mut SessionContext) -> Result<StepResponse, FlowError> {
        let provider = provider_of(ctx)?;
        let args = json!({
            "provider": provider.id,
            "org_ref": provider.org_ref,
            "category": ctx.intent.category,
        });
        let value = self.gateway.invoke(DISCOVERY_TOOL, args, ctx).await?;

        let fields: Vec<DiscoveredField> = value
            .get("fields")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| malformed(DISCOVERY_TOOL, e))?
            .ok_or_else(|| malformed(DISCOVERY_TOOL, "missing fields"))?;
        let confidence = value.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);

        tracing::info!(fields = fields.len(), confidence, "signup form fields discovered");
        let message = format!(
            "I've looked at {}'s signup form. It asks for {} detail{}.",
            provider.name,
            fields.len(),
            if fields.len() == 1 { "" } else { "s" }
        );
        Ok(StepResponse::text(message)
            .with_updates(vec![ContextUpdate::DiscoveredFields { fields, confidence }])
            .advancing())
    }

    async fn program_selection(&self, message: &str, ctx: &mut SessionContext) -> Result<StepResponse, FlowError> {
        let provider = provider_of(ctx)?;
        let tool = Operation::FindPrograms.tool_name(&provider.id);
        let args = json!({
            "category": ctx.intent.category,
            "child_age": ctx.intent.child_age,
        });
        let value = self.gateway.invoke(&tool, args, ctx).await?;
        let rows: Vec<ProgramRow> = parse_list(&tool, &value, "programs")?;

        if rows.is_empty() {
            return Ok(StepResponse::text(format!(
                "{} doesn't have any matching programs open right now.",
                provider.name
            ))
            .with_cta(vec![
                Button::new("Try again", FlowAction::Retry),
                Button::new("Choose another provider", FlowAction::ChangeProvider),
            ]));
        }

        let wanted = message.trim().to_lowercase();
        if !wanted.is_empty() {
            if let Some(row) = rows.iter().find(|r| r.title.to_lowercase() == wanted || r.id == wanted) {
                let program = row.to_program();
                return Ok(StepResponse::text(format!("Great, {} it is.", program.title))
                    .with_updates(vec![ContextUpdate::Program(program)])
                    .advancing());
            }
        }

        let cards = rows
            .iter()
            .map(|row| Card {
                title: row.title.clone(),
                subtitle: row.subtitle(),
                buttons: vec![Button::new("Choose", FlowAction::SelectProgram(row.to_program()))],
            })
            .collect();
        Ok(StepResponse::text("Here are the programs that fit. Which one would you like?").with_cards(cards))
    }

    async fn prerequisite_check(&self, ctx: &mut SessionContext) -> Result<StepResponse, FlowError> {
        let provider = provider_of(ctx)?;
        let program_id = ctx
            .program
            .as_ref()
            .map(|p| p.id.clone())
            .ok_or_else(|| FlowError::Internal("prerequisite check without a program".into()))?;
        let tool = Operation::CheckPrerequisites.tool_name(&provider.id);
        let value = self
            .gateway
            .invoke(&tool, json!({ "program_id": program_id, "child": ctx.child }), ctx)
            .await?;
        let results = parse_prerequisites(&tool, &value)?;

        let failed: Vec<&PrerequisiteResult> = results.iter().filter(|r| !r.passed).collect();
        if failed.is_empty() {
            return Ok(StepResponse::text("All prerequisites are in place.")
                .with_updates(vec![ContextUpdate::Prerequisites(results)])
                .advancing());
        }

        let missing = failed
            .iter()
            .map(|r| match &r.detail {
                Some(d) => format!("{} ({d})", r.name),
                None => r.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Ok(StepResponse::text(format!(
            "Before I can register you, {} needs: {missing}. Let me know once that's done.",
            provider.name
        ))
        .with_cta(vec![
            Button::new("I've taken care of it", FlowAction::Retry),
            Button::new("Choose another program", FlowAction::ChooseAnotherProgram),
        ]))
    }

    async fn confirmation(
        &self,
        message: &str,
        action: Option<&FlowAction>,
        ctx: &mut SessionContext,
    ) -> Result<StepResponse, FlowError> {
        let confirmed = matches!(action, Some(FlowAction::ConfirmRegistration))
            || (ctx.current_step == Some(Step::Confirmation) && is_affirmative(message));
        if !confirmed {
            return Ok(confirmation_summary(ctx));
        }

        let provider = provider_of(ctx)?;
        let program = ctx
            .program
            .clone()
            .ok_or_else(|| FlowError::Internal("confirmation without a program".into()))?;

        let tool = Operation::CheckAvailability.tool_name(&provider.id);
        let availability = self
            .gateway
            .invoke(&tool, json!({ "program_id": program.id }), ctx)
            .await?;
        if availability.get("available").and_then(Value::as_bool) == Some(false) {
            return Err(ToolError::Business {
                tool,
                kind: FailureKind::ProgramFull,
                message: format!("{} has no open spots", program.title),
            }
            .into());
        }

        let tool = Operation::Register.tool_name(&provider.id);
        let args = json!({
            "program_id": program.id,
            "child": ctx.child,
            "answers": ctx.form_answers,
        });
        let value = self.gateway.invoke(&tool, args, ctx).await?;
        let registration = ["registration_ref", "registration_id", "confirmation"]
            .iter()
            .find_map(|k| value.get(*k))
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| malformed(&tool, "missing registration reference"))?;

        tracing::info!(provider = %provider.id, program = %program.id, "registration completed");
        Ok(StepResponse::text(format!(
            "You're registered for {}! Your confirmation number is {registration}.",
            program.title
        ))
        .with_updates(vec![ContextUpdate::Registration(registration)]))
    }
}

fn intent_capture(message: &str, ctx: &SessionContext) -> StepResponse {
    let mut updates = Vec::new();
    let mut category = ctx.intent.category.clone();
    let mut age = ctx.intent.child_age;

    if category.is_none() {
        if let Some(c) = extract_category(message) {
            updates.push(ContextUpdate::IntentCategory(c.clone()));
            category = Some(c);
        }
    }
    if age.is_none() {
        if let Some(a) = extract_age(message) {
            updates.push(ContextUpdate::ChildAge(a));
            age = Some(a);
        }
    }

    let response = match (category, age) {
        (Some(c), Some(a)) => {
            return StepResponse::text(format!("Got it: {c} for a {a}-year-old."))
                .with_updates(updates)
                .advancing();
        }
        (Some(c), None) => StepResponse::text(format!("How old is the child who'll be doing {c}?")),
        (None, Some(_)) => StepResponse::text("What kind of program are you looking for? For example ski, swim or soccer."),
        (None, None) => StepResponse::text(
            "What kind of program are you looking for, and how old is your child?",
        ),
    };
    response.with_updates(updates)
}

fn form_fill(message: &str, ctx: &SessionContext) -> StepResponse {
    let mut updates = Vec::new();
    let mut answered: Vec<String> = Vec::new();

    if let Some(age) = ctx.intent.child_age {
        for field in ctx.missing_required_fields() {
            if is_age_field(&field.id) {
                updates.push(ContextUpdate::FormAnswer {
                    field: field.id.clone(),
                    value: age.to_string(),
                });
                answered.push(field.id.clone());
            }
        }
    }

    let mut missing: Vec<&DiscoveredField> = ctx
        .missing_required_fields()
        .into_iter()
        .filter(|f| !answered.contains(&f.id))
        .collect();

    let mut note = None;
    let answer = message.trim();
    if ctx.current_step == Some(Step::FormFill) && !answer.is_empty() {
        if let Some(field) = missing.first() {
            match validate_answer(field.field_type, answer) {
                Ok(value) => {
                    updates.push(ContextUpdate::FormAnswer {
                        field: field.id.clone(),
                        value,
                    });
                    missing.remove(0);
                }
                Err(hint) => note = Some(hint),
            }
        }
    }

    let Some(next) = missing.first() else {
        updates.push(ContextUpdate::FormComplete);
        return StepResponse::text("Thanks, that's everything the form needs.")
            .with_updates(updates)
            .advancing();
    };

    let question = match note {
        Some(hint) => format!("{hint} What's the {}?", next.label.to_lowercase()),
        None => format!("What's the {}?", next.label.to_lowercase()),
    };
    let cta = if next.field_type == FieldType::Checkbox {
        ["Yes", "No"]
            .into_iter()
            .map(|label| {
                Button::new(
                    label,
                    FlowAction::AnswerField {
                        field: next.id.clone(),
                        value: (label == "Yes").to_string(),
                    },
                )
            })
            .collect()
    } else {
        Vec::new()
    };
    StepResponse::text(question).with_cta(cta).with_updates(updates)
}

fn confirmation_summary(ctx: &SessionContext) -> StepResponse {
    let provider = ctx.provider.as_ref().map(|p| p.name.as_str()).unwrap_or("the provider");
    let program = ctx.program.as_ref();
    let title = program.map(|p| p.title.as_str()).unwrap_or("the program");
    let who = match (&ctx.child, ctx.intent.child_age) {
        (Some(child), _) => child.name.clone(),
        (None, Some(age)) => format!("your {age}-year-old"),
        (None, None) => "your child".to_string(),
    };
    let price = program
        .and_then(|p| p.price_cents)
        .map(|c| format!(" The price is {}.", format_cents(c)))
        .unwrap_or_default();

    StepResponse::text(format!(
        "Ready to register {who} for {title} with {provider}?{price}"
    ))
    .with_cta(vec![
        Button::new("Confirm registration", FlowAction::ConfirmRegistration),
        Button::new("Review my answers", FlowAction::ReviewForm),
        Button::new("Cancel", FlowAction::CancelRegistration),
    ])
}

fn completed(ctx: &SessionContext) -> StepResponse {
    let reference = ctx.registration_ref.as_deref().unwrap_or("");
    StepResponse::text(format!(
        "You're all set. Your registration reference is {reference}."
    ))
    .with_cta(vec![Button::new("Register for something else", FlowAction::StartOver)])
}

fn provider_of(ctx: &SessionContext) -> Result<ProviderRef, FlowError> {
    ctx.provider
        .clone()
        .ok_or_else(|| FlowError::Internal("step requires a provider".into()))
}

fn malformed(tool: &str, detail: impl ToString) -> FlowError {
    FlowError::MalformedResponse {
        tool: tool.to_string(),
        detail: detail.to_string(),
    }
}

/// 工具可以直接返回数组，也可以包在 `{key: [...]}` 中
fn parse_list<T: for<'de> Deserialize<'de>>(tool: &str, value: &Value, key: &str) -> Result<Vec<T>, FlowError> {
    let list = match value {
        Value::Array(_) => value,
        Value::Object(obj) => obj
            .get(key)
            .filter(|v| v.is_array())
            .ok_or_else(|| malformed(tool, format!("expected `{key}` array")))?,
        _ => return Err(malformed(tool, "expected an array or object")),
    };
    serde_json::from_value(list.clone()).map_err(|e| malformed(tool, e))
}

/// 前置条件：`[{name, passed, detail?}]` 或 `{name: bool}`
fn parse_prerequisites(tool: &str, value: &Value) -> Result<Vec<PrerequisiteResult>, FlowError> {
    let inner = value.get("prerequisites").unwrap_or(value);
    match inner {
        Value::Array(_) => serde_json::from_value(inner.clone()).map_err(|e| malformed(tool, e)),
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| k.as_str() != "success")
            .map(|(name, v)| {
                v.as_bool()
                    .map(|passed| PrerequisiteResult {
                        name: name.clone(),
                        passed,
                        detail: None,
                    })
                    .ok_or_else(|| malformed(tool, format!("prerequisite `{name}` is not a boolean")))
            })
            .collect(),
        _ => Err(malformed(tool, "expected prerequisites")),
    }
}

#[derive(Debug, Deserialize)]
struct ProviderRow {
    id: String,
    name: String,
    #[serde(default, alias = "orgRef")]
    org_ref: Option<String>,
    #[serde(default, alias = "city")]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgramRow {
    id: String,
    #[serde(alias = "name")]
    title: String,
    #[serde(default, alias = "priceCents")]
    price_cents: Option<u64>,
    #[serde(default)]
    schedule: Option<String>,
}

impl ProgramRow {
    fn to_program(&self) -> ProgramRef {
        ProgramRef {
            id: self.id.clone(),
            title: self.title.clone(),
            price_cents: self.price_cents,
        }
    }

    fn subtitle(&self) -> Option<String> {
        match (&self.schedule, self.price_cents) {
            (Some(s), Some(c)) => Some(format!("{s} · {}", format_cents(c))),
            (Some(s), None) => Some(s.clone()),
            (None, Some(c)) => Some(format_cents(c)),
            (None, None) => None,
        }
    }
}

fn format_cents(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

fn age_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2})\s*(?:-\s*)?(?:years?|yrs?|y/?o)?\b").expect("static regex")
    })
}

fn category_re() -> &'static [(Regex, &'static str)] {
    static TABLE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        [
            (r"(?i)\bski(ing|s)?\b|snowboard", "ski"),
            (r"(?i)\bswim(ming)?\b", "swim"),
            (r"(?i)\bsoccer\b|\bfootball\b", "soccer"),
            (r"(?i)\bbasketball\b", "basketball"),
            (r"(?i)\btennis\b", "tennis"),
            (r"(?i)\bhockey\b", "hockey"),
            (r"(?i)\b(skating|skate)\b", "skating"),
            (r"(?i)\bgymnastics?\b", "gymnastics"),
            (r"(?i)\bdanc(e|ing)\b|\bballet\b", "dance"),
            (r"(?i)\b(karate|martial arts|judo|taekwondo)\b", "martial arts"),
            (r"(?i)\b(music|piano|guitar|violin)\b", "music"),
            (r"(?i)\b(art|arts|painting|drawing)\b", "art"),
            (r"(?i)\bcamps?\b", "camp"),
        ]
        .into_iter()
        .map(|(p, c)| (Regex::new(p).expect("static regex"), c))
        .collect()
    })
}

/// 消息中的孩子年龄（1..=18）
pub fn extract_age(message: &str) -> Option<u8> {
    age_re()
        .captures_iter(message)
        .filter_map(|c| c.get(1)?.as_str().parse::<u8>().ok())
        .find(|a| (1..=18).contains(a))
}

pub fn extract_category(message: &str) -> Option<String> {
    category_re()
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, c)| c.to_string())
}

fn is_affirmative(message: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(yes|yep|yeah|confirm|go ahead|do it|register|sure)\b").expect("static regex")
    })
    .is_match(message)
}

fn is_age_field(id: &str) -> bool {
    id.split('_').any(|t| t == "age")
}

/// 按字段类型校验并规整用户答案
pub fn validate_answer(field_type: FieldType, raw: &str) -> Result<String, &'static str> {
    let value = raw.trim();
    if value.is_empty() {
        return Err("I didn't catch that.");
    }
    match field_type {
        FieldType::Email => {
            let ok = value
                .split_once('@')
                .map(|(user, domain)| !user.is_empty() && domain.contains('.') && !domain.ends_with('.'))
                .unwrap_or(false);
            if ok {
                Ok(value.to_string())
            } else {
                Err("That doesn't look like an email address.")
            }
        }
        FieldType::Phone => {
            let digits: String = value.chars().filter(char::is_ascii_digit).collect();
            if (7..=15).contains(&digits.len()) {
                Ok(digits)
            } else {
                Err("That doesn't look like a phone number.")
            }
        }
        FieldType::Number => value
            .parse::<f64>()
            .map(|_| value.to_string())
            .map_err(|_| "Please answer with a number."),
        FieldType::Date => ["%Y-%m-%d", "%m/%d/%Y"]
            .iter()
            .find_map(|fmt| chrono::NaiveDate::parse_from_str(value, fmt).ok())
            .map(|d| d.format("%Y-%m-%d").to_string())
            .ok_or("Please give the date as YYYY-MM-DD."),
        FieldType::Checkbox => match value.to_lowercase().as_str() {
            "yes" | "y" | "true" | "agree" | "i agree" => Ok("true".to_string()),
            "no" | "n" | "false" => Ok("false".to_string()),
            _ => Err("Please answer yes or no."),
        },
        FieldType::Select | FieldType::Text => Ok(value.to_string()),
    }
}
