//! 缓存键：对 (工具名, 参数) 做规范化后取 SHA-256
//!
//! 对象键递归排序；委托、会话令牌等每次调用都会变化的鉴权字段不参与计算。

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// 不参与缓存键的参数字段
pub const VOLATILE_ARGS: &[&str] = &["mandate", "session_token"];

pub fn cache_key(tool: &str, args: &Value) -> String {
    let canonical = canonicalize(args, true);
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.to_string().as_bytes());
    format!("tool:{}:{}", tool, hex::encode(hasher.finalize()))
}

fn canonicalize(value: &Value, top_level: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !(top_level && VOLATILE_ARGS.contains(&k.as_str())))
                .collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k], false));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| canonicalize(v, false)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_deterministic_and_order_free() {
        let a = cache_key("provider_search", &json!({"query": "acme", "limit": 5}));
        let b = cache_key("provider_search", &json!({"limit": 5, "query": "acme"}));
        assert_eq!(a, b);
        assert!(a.starts_with("tool:provider_search:"));
    }

    #[test]
    fn test_volatile_auth_fields_ignored() {
        let a = cache_key("acme_find_programs", &json!({"q": 1, "mandate": {"id": "m1"}, "session_token": "t1"}));
        let b = cache_key("acme_find_programs", &json!({"q": 1, "mandate": {"id": "m2"}}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_tool_name_and_args_distinguish() {
        let args = json!({"q": 1});
        assert_ne!(cache_key("a", &args), cache_key("b", &args));
        assert_ne!(cache_key("a", &args), cache_key("a", &json!({"q": 2})));
    }
}
