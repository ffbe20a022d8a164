use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::error::Failure;

/// フィールドの意味的な型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    /// UTCオフセット付きの RFC 3339 日時
    Timestamp,
    Integer,
    StringList,
    /// 列挙された値のいずれか
    Enumeration(Vec<String>),
}

impl FieldType {
    /// プロンプトに埋め込む型の説明
    fn describe(&self) -> String {
        match self {
            FieldType::String => "string".to_string(),
            FieldType::Timestamp => {
                "timestamp (ISO 8601 / RFC 3339 date-time with an explicit UTC offset)".to_string()
            }
            FieldType::Integer => "integer".to_string(),
            FieldType::StringList => "list of strings".to_string(),
            FieldType::Enumeration(values) => format!("one of: {}", values.join(", ")),
        }
    }

    /// 出力例のJSONに使うプレースホルダ
    fn placeholder(&self) -> Value {
        match self {
            FieldType::String => Value::from("<string>"),
            FieldType::Timestamp => Value::from("<YYYY-MM-DDTHH:MM:SS+HH:MM>"),
            FieldType::Integer => Value::from(0),
            FieldType::StringList => Value::from(vec!["<string>"]),
            FieldType::Enumeration(values) => Value::from(format!("<{}>", values.join("|"))),
        }
    }

    /// 変換済みの値がこの型に適合するか
    pub fn admits(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (FieldType::String, FieldValue::Text(_)) => true,
            (FieldType::Enumeration(allowed), FieldValue::Text(text)) => allowed.contains(text),
            (FieldType::Timestamp, FieldValue::Timestamp(_)) => true,
            (FieldType::Integer, FieldValue::Integer(_)) => true,
            (FieldType::StringList, FieldValue::List(_)) => true,
            _ => false,
        }
    }

    fn coerce(&self, value: &Value) -> Option<FieldValue> {
        match self {
            FieldType::String => scalar_text(value).map(FieldValue::Text),
            FieldType::Integer => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().and_then(whole_i64)),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
            .map(FieldValue::Integer),
            FieldType::Timestamp => value
                .as_str()
                .and_then(parse_timestamp)
                .map(FieldValue::Timestamp),
            FieldType::StringList => value
                .as_array()?
                .iter()
                .map(scalar_text)
                .collect::<Option<Vec<_>>>()
                .map(FieldValue::List),
            FieldType::Enumeration(allowed) => value
                .as_str()
                .map(str::trim)
                .filter(|s| allowed.iter().any(|a| a == s))
                .map(|s| FieldValue::Text(s.to_string())),
        }
    }
}

/// スキーマの1フィールド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    /// 補完プロバイダへの説明文
    pub description: String,
    pub required: bool,
}

impl Field {
    pub fn new(name: &str, field_type: FieldType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// 抽出対象を表す、順序付きのフィールド定義
///
/// ビルダーで組み立てた後は変更できない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    name: String,
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// フィールド名・型・説明をプロンプト用の箇条書きにする
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for field in &self.fields {
            let _ = writeln!(
                out,
                "- {} ({}, {}): {}",
                field.name,
                field.field_type.describe(),
                if field.required { "required" } else { "optional" },
                field.description
            );
        }
        out
    }

    /// 期待するJSONオブジェクトの骨組み
    pub fn hint(&self) -> String {
        let skeleton: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type.placeholder()))
            .collect();
        serde_json::to_string_pretty(&Value::Object(skeleton)).unwrap_or_default()
    }

    /// JSONの値をスキーマに沿って変換・検証する
    ///
    /// 未知のフィールドは無視する。必須フィールドが欠けていれば
    /// `MissingField`、型が合わなければ `Validation` を返す。
    pub fn validate(&self, value: &Value) -> Result<Record, Failure> {
        let object = value
            .as_object()
            .ok_or_else(|| Failure::Validation(self.name.clone()))?;

        let mut values = BTreeMap::new();
        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(Failure::MissingField(field.name.clone()));
                    }
                }
                Some(raw) => {
                    let coerced = field
                        .field_type
                        .coerce(raw)
                        .ok_or_else(|| Failure::Validation(field.name.clone()))?;
                    values.insert(field.name.clone(), coerced);
                }
            }
        }

        Ok(Record {
            schema: self.name.clone(),
            values,
        })
    }
}

/// 変換済みのフィールド値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Timestamp(DateTime<FixedOffset>),
    Integer(i64),
    List(Vec<String>),
}

/// 検証済みのレコード
///
/// `Schema::validate` からしか作れないため、存在するレコードは
/// 常にいずれかのスキーマを満たしている。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    schema: String,
    values: BTreeMap<String, FieldValue>,
}

impl Record {
    /// 検証に使ったスキーマ名
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(FieldValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn timestamp(&self, name: &str) -> Option<DateTime<FixedOffset>> {
        match self.values.get(name) {
            Some(FieldValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(FieldValue::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn list(&self, name: &str) -> Option<&[String]> {
        match self.values.get(name) {
            Some(FieldValue::List(items)) => Some(items),
            _ => None,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// オフセット必須で日時を解釈する
pub fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value.trim()).ok()
}

/// 整数値で、かつ i64 に収まる浮動小数だけを受け付ける
fn whole_i64(f: f64) -> Option<i64> {
    // i64::MAX as f64 は 2^63 に丸められるので上限は開区間
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then(|| f as i64)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meeting() -> Schema {
        Schema::new("meeting")
            .field(Field::new("title", FieldType::String, "Title of the meeting"))
            .field(Field::new("startTime", FieldType::Timestamp, "Start time"))
            .field(Field::new("duration_minutes", FieldType::Integer, "Duration").optional())
            .field(Field::new("attendees", FieldType::StringList, "Attendee emails"))
            .field(Field::new(
                "priority",
                FieldType::Enumeration(vec!["low".into(), "high".into()]),
                "Priority",
            ))
    }

    #[test]
    fn validate_coerces_each_type() {
        let record = meeting()
            .validate(&json!({
                "title": "Design review",
                "startTime": "2025-03-04T10:00:00+05:30",
                "duration_minutes": "45",
                "attendees": ["a@example.com", "b@example.com"],
                "priority": "high",
                "room": "ignored"
            }))
            .unwrap();

        assert_eq!(record.schema(), "meeting");
        assert_eq!(record.text("title"), Some("Design review"));
        assert_eq!(
            record.timestamp("startTime").unwrap().to_rfc3339(),
            "2025-03-04T10:00:00+05:30"
        );
        assert_eq!(record.integer("duration_minutes"), Some(45));
        assert_eq!(record.list("attendees").unwrap().len(), 2);
        assert_eq!(record.text("priority"), Some("high"));
        assert!(record.get("room").is_none());
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let record = meeting()
            .validate(&json!({
                "title": "Sync",
                "startTime": "2025-03-04T10:00:00Z",
                "attendees": [],
                "priority": "low"
            }))
            .unwrap();

        assert!(record.integer("duration_minutes").is_none());
        assert_eq!(record.field_names().count(), 4);
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let err = meeting()
            .validate(&json!({
                "title": "Sync",
                "startTime": "2025-03-04T10:00:00Z",
                "priority": "low",
                "attendees": null
            }))
            .unwrap_err();

        assert_eq!(err, Failure::MissingField("attendees".into()));
    }

    #[test]
    fn timestamp_without_offset_is_rejected() {
        let err = meeting()
            .validate(&json!({
                "title": "Sync",
                "startTime": "2025-03-04T10:00:00",
                "attendees": [],
                "priority": "low"
            }))
            .unwrap_err();

        assert_eq!(err.to_string(), "validation error: startTime");
    }

    #[test]
    fn enumeration_outside_declared_values_is_rejected() {
        let err = meeting()
            .validate(&json!({
                "title": "Sync",
                "startTime": "2025-03-04T10:00:00Z",
                "attendees": [],
                "priority": "urgent"
            }))
            .unwrap_err();

        assert_eq!(err, Failure::Validation("priority".into()));
    }

    #[test]
    fn integers_must_fit_without_truncation() {
        let schema = Schema::new("count").field(Field::new("n", FieldType::Integer, "Count"));

        assert_eq!(schema.validate(&json!({"n": 30.0})).unwrap().integer("n"), Some(30));
        assert_eq!(schema.validate(&json!({"n": -2})).unwrap().integer("n"), Some(-2));
        for bad in [json!({"n": 1e20}), json!({"n": -1e20}), json!({"n": 2.5}), json!({"n": "ten"})] {
            assert_eq!(schema.validate(&bad).unwrap_err(), Failure::Validation("n".into()));
        }
    }

    #[test]
    fn nested_values_are_not_coerced_to_text() {
        let err = meeting()
            .validate(&json!({
                "title": {"text": "Sync"},
                "startTime": "2025-03-04T10:00:00Z",
                "attendees": [],
                "priority": "low"
            }))
            .unwrap_err();

        assert_eq!(err, Failure::Validation("title".into()));
    }

    #[test]
    fn describe_and_hint_mention_every_field() {
        let schema = meeting();
        let description = schema.describe();
        let hint: Value = serde_json::from_str(&schema.hint()).unwrap();

        for field in schema.fields() {
            assert!(description.contains(&field.name));
            assert!(hint.get(&field.name).is_some());
        }
        assert!(description.contains("one of: low, high"));
        assert!(description.contains("duration_minutes (integer, optional)"));
    }

    #[test]
    fn admits_checks_value_kinds() {
        let enumeration = FieldType::Enumeration(vec!["a".into()]);
        assert!(enumeration.admits(&FieldValue::Text("a".into())));
        assert!(!enumeration.admits(&FieldValue::Text("b".into())));
        assert!(!FieldType::Integer.admits(&FieldValue::Text("1".into())));
    }
}
