//! 内部细节脱敏
//!
//! 工具参数、错误文本在写日志或展示前都先经过这里：遮蔽令牌 / 密码 / 签名，去掉堆栈行，截断长度。

use std::sync::OnceLock;

use regex::Regex;

const MAX_PREVIEW_CHARS: usize = 200;

fn secret_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)("?(?:session_token|token|password|secret|signature|api_key|authorization)"?\s*[:=]\s*)("[^"]*"|[^\s,}]+)"#,
        )
        .expect("static regex")
    })
}

/// 遮蔽敏感字段并截断到预览长度
pub fn redact(text: &str) -> String {
    let masked = secret_re().replace_all(text, "${1}\"[redacted]\"");
    truncate(&masked, MAX_PREVIEW_CHARS)
}

/// 面向日志的错误详情：去掉堆栈行后再遮蔽
pub fn sanitize_detail(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !l.starts_with("at ") && !l.starts_with("stack backtrace") && !l.starts_with("Traceback"))
        .collect();
    redact(&kept.join(" "))
}

/// JSON 参数预览（与工具审计日志共用）
pub fn args_preview(args: &serde_json::Value) -> String {
    redact(&args.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
