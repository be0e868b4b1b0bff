//! 探测到的表单字段

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// 推断出的字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Email,
    Phone,
    Number,
    Date,
    Checkbox,
    Select,
    Text,
}

impl FieldType {
    /// 自动填充用的合成值，永远不是用户的真实数据
    pub fn synthetic_value(self) -> Option<&'static str> {
        match self {
            FieldType::Email => Some("test+probe@example.com"),
            FieldType::Phone => Some("5555550100"),
            FieldType::Number => Some("10"),
            FieldType::Date => Some("2015-01-01"),
            FieldType::Text => Some("Test"),
            // 复选框用点击，下拉框没有可安全猜测的取值
            FieldType::Checkbox | FieldType::Select => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredField {
    /// 推断的字段标识（name / id / 提示文本）
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    /// 页面给出的校验提示
    #[serde(default)]
    pub message: Option<String>,
    /// 定位该字段的选择器
    #[serde(default)]
    pub locator: Option<String>,
}

/// 去重、保持插入顺序、只增不减的字段集合
#[derive(Debug, Default, Clone)]
pub struct FieldMap {
    fields: Vec<DiscoveredField>,
    seen: HashSet<String>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 未出现过的 id 才插入；返回是否新增
    pub fn insert(&mut self, field: DiscoveredField) -> bool {
        if !self.seen.insert(field.id.clone()) {
            return false;
        }
        self.fields.push(field);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_fields(self) -> Vec<DiscoveredField> {
        self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(id: &str) -> DiscoveredField {
        DiscoveredField {
            id: id.into(),
            label: id.into(),
            field_type: FieldType::Text,
            required: true,
            message: None,
            locator: None,
        }
    }

    #[test]
    fn test_field_map_dedupes_and_keeps_order() {
        let mut map = FieldMap::new();
        assert!(map.insert(field("email")));
        assert!(map.insert(field("age")));
        assert!(!map.insert(field("email")));
        let ids: Vec<String> = map.into_fields().into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["email", "age"]);
    }

    #[test]
    fn test_field_serializes_type_key() {
        let v = serde_json::to_value(field("email")).unwrap();
        assert_eq!(v["type"], "text");
    }
}
