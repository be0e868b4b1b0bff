//! 字段推断：标识、可读标签、类型
//!
//! 校验错误元素上的属性优先（data-field / for / name / id），其次从提示文本里抽取
//! （"Email is required" → email）。

use std::sync::OnceLock;

use regex::Regex;

use super::field::FieldType;

/// 错误提示元素 id 常见后缀，去掉后得到字段标识
const ERROR_ID_SUFFIXES: &[&str] = &["-error", "_error", "Error", "-feedback", "_feedback", "-message", "-help"];

/// 不参与自动填充的 input 类型
const NON_EDITABLE_TYPES: &[&str] = &["submit", "button", "hidden", "reset", "image", "file"];

fn prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:please\s+(?:enter|provide|select|choose|fill in)\s+)?(?:a\s+|an\s+|the\s+|your\s+)?")
            .expect("static regex")
    })
}

fn tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s+(?:(?:field\s+)?(?:is|are)\s+)?(?:required|invalid|missing|must|cannot|can't|should)\b")
            .expect("static regex")
    })
}

/// 按属性推断字段标识；参数按优先级给出
pub fn identity_from_attrs(candidates: &[Option<String>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .map(|raw| strip_error_suffix(raw.trim()))
        .find(|s| !s.is_empty())
        .map(|s| slug(&s))
        .filter(|s| !s.is_empty())
}

/// 从提示文本推断字段标识
pub fn identity_from_message(message: &str) -> Option<String> {
    let text = message.trim();
    if text.is_empty() {
        return None;
    }
    let mut subject = prefix_re().replace(text, "").into_owned();
    if let Some(m) = tail_re().find(&subject) {
        subject.truncate(m.start());
    }
    let subject = subject.replace("'s", "").replace('\u{2019}', "");
    let id = slug(&subject.chars().take(40).collect::<String>());
    (!id.is_empty()).then_some(id)
}

fn strip_error_suffix(raw: &str) -> String {
    for suffix in ERROR_ID_SUFFIXES {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    raw.to_string()
}

/// 小写 + 下划线分隔；camelCase 拆开
pub fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_lower = false;
    for c in raw.chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
        } else {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out.trim_matches('_').to_string()
}

/// child_age → "Child age"
pub fn humanize(id: &str) -> String {
    let words = slug(id).replace('_', " ");
    let mut chars = words.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// 按控件属性与命名推断类型
pub fn infer_type(id: &str, input_type: Option<&str>, tag: Option<&str>) -> FieldType {
    match input_type.map(str::to_ascii_lowercase).as_deref() {
        Some("email") => return FieldType::Email,
        Some("tel") => return FieldType::Phone,
        Some("number") | Some("range") => return FieldType::Number,
        Some("date") | Some("datetime-local") => return FieldType::Date,
        Some("checkbox") | Some("radio") => return FieldType::Checkbox,
        _ => {}
    }
    if tag.is_some_and(|t| t.eq_ignore_ascii_case("select")) {
        return FieldType::Select;
    }

    let id = slug(id);
    let tokens: Vec<&str> = id.split('_').collect();
    let has = |words: &[&str]| tokens.iter().any(|t| words.contains(t));
    if has(&["email", "mail"]) {
        FieldType::Email
    } else if has(&["phone", "telephone", "mobile", "cell", "tel"]) {
        FieldType::Phone
    } else if has(&["date", "dob", "birth", "birthday", "birthdate"]) {
        FieldType::Date
    } else if has(&["age", "count", "number", "qty", "quantity", "grade"]) {
        FieldType::Number
    } else if has(&["agree", "terms", "waiver", "consent", "accept"]) {
        FieldType::Checkbox
    } else {
        FieldType::Text
    }
}

/// 可自动填充的输入控件
pub fn is_editable(input_type: Option<&str>, readonly: bool, disabled: bool) -> bool {
    if readonly || disabled {
        return false;
    }
    !input_type.is_some_and(|t| NON_EDITABLE_TYPES.contains(&t.to_ascii_lowercase().as_str()))
}
