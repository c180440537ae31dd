//! Input schemas for scraper runs.
//!
//! A schema is a closed list of typed fields. Validation walks the fields in
//! declaration order and stops at the first offending one, reporting its path
//! (`links[2]`, `filters.city`, ...). The validated value is normalized:
//! optional fields with a default are filled in and explicit `null`s dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

/// Path reported when the payload itself is not an object.
pub const ROOT_PATH: &str = "$";

/// Declared kind of an input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    /// Any JSON number; integers are accepted too.
    Number,
    Boolean,
    /// A string restricted to the declared choices.
    Choice { choices: Vec<String> },
    List { item: Box<FieldKind> },
    Object { schema: InputSchema },
}

impl FieldKind {
    pub fn choice<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldKind::Choice {
            choices: choices.into_iter().map(Into::into).collect(),
        }
    }

    pub fn list(item: FieldKind) -> Self {
        FieldKind::List {
            item: Box::new(item),
        }
    }

    fn describe(&self) -> String {
        match self {
            FieldKind::Text => "text".into(),
            FieldKind::Integer => "an integer".into(),
            FieldKind::Number => "a number".into(),
            FieldKind::Boolean => "a boolean".into(),
            FieldKind::Choice { choices } => format!("one of [{}]", choices.join(", ")),
            FieldKind::List { .. } => "a list".into(),
            FieldKind::Object { .. } => "an object".into(),
        }
    }

    fn validate(&self, value: &Value, path: &str) -> Result<Value, AppError> {
        let mismatch = || AppError::validation(path, format!("expected {}", self.describe()));
        match self {
            FieldKind::Text => value.is_string().then(|| value.clone()).ok_or_else(mismatch),
            FieldKind::Integer => (value.is_i64() || value.is_u64())
                .then(|| value.clone())
                .ok_or_else(mismatch),
            FieldKind::Number => value.is_number().then(|| value.clone()).ok_or_else(mismatch),
            FieldKind::Boolean => value.is_boolean().then(|| value.clone()).ok_or_else(mismatch),
            FieldKind::Choice { choices } => match value.as_str() {
                Some(s) if choices.iter().any(|c| c == s) => Ok(value.clone()),
                _ => Err(mismatch()),
            },
            FieldKind::List { item } => {
                let items = value.as_array().ok_or_else(mismatch)?;
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| item.validate(v, &format!("{path}[{i}]")))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            FieldKind::Object { schema } => {
                let map = value.as_object().ok_or_else(mismatch)?;
                schema.validate_object(map, Some(path)).map(Value::Object)
            }
        }
    }

    fn to_json_schema(&self) -> Value {
        match self {
            FieldKind::Text => serde_json::json!({"type": "string"}),
            FieldKind::Integer => serde_json::json!({"type": "integer"}),
            FieldKind::Number => serde_json::json!({"type": "number"}),
            FieldKind::Boolean => serde_json::json!({"type": "boolean"}),
            FieldKind::Choice { choices } => serde_json::json!({"type": "string", "enum": choices}),
            FieldKind::List { item } => {
                serde_json::json!({"type": "array", "items": item.to_json_schema()})
            }
            FieldKind::Object { schema } => schema.to_json_schema(),
        }
    }

    fn check(&self, path: &str) -> Result<(), String> {
        match self {
            FieldKind::Choice { choices } if choices.is_empty() => {
                Err(format!("choice field '{path}' declares no choices"))
            }
            FieldKind::List { item } => item.check(&format!("{path}[]")),
            FieldKind::Object { schema } => schema.check_fields(Some(path)),
            _ => Ok(()),
        }
    }
}

/// One named input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            description: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Shape of a scraper's run input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    pub fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a raw run payload, returning the normalized input.
    ///
    /// `null` is accepted as an empty payload.
    pub fn validate(&self, raw: &Value) -> Result<Value, AppError> {
        match raw {
            Value::Null => self.validate_object(&Map::new(), None).map(Value::Object),
            Value::Object(map) => self.validate_object(map, None).map(Value::Object),
            _ => Err(AppError::validation(ROOT_PATH, "expected a JSON object")),
        }
    }

    /// Check the schema itself: unique non-empty names, non-empty choice
    /// lists and defaults that satisfy their own field kind.
    pub fn check(&self) -> Result<(), String> {
        self.check_fields(None)
    }

    /// Render the schema as a JSON Schema document.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut property = field.kind.to_json_schema();
            if let Value::Object(obj) = &mut property {
                if let Some(default) = &field.default {
                    obj.insert("default".into(), default.clone());
                }
                if let Some(description) = &field.description {
                    obj.insert("description".into(), Value::String(description.clone()));
                }
            }
            properties.insert(field.name.clone(), property);
            if field.required {
                required.push(Value::String(field.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    fn validate_object(
        &self,
        map: &Map<String, Value>,
        prefix: Option<&str>,
    ) -> Result<Map<String, Value>, AppError> {
        let mut normalized = Map::new();

        for field in &self.fields {
            let path = join_path(prefix, &field.name);
            match map.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(AppError::validation(path, "required field is missing"));
                    }
                    if let Some(default) = &field.default {
                        normalized.insert(field.name.clone(), default.clone());
                    }
                }
                Some(value) => {
                    normalized.insert(field.name.clone(), field.kind.validate(value, &path)?);
                }
            }
        }

        if let Some(unknown) = map.keys().find(|k| self.get(k).is_none()) {
            return Err(AppError::validation(
                join_path(prefix, unknown),
                "unknown field",
            ));
        }

        Ok(normalized)
    }

    fn check_fields(&self, prefix: Option<&str>) -> Result<(), String> {
        for (i, field) in self.fields.iter().enumerate() {
            let path = join_path(prefix, &field.name);
            if field.name.is_empty() {
                return Err(format!("input field #{i} has an empty name"));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(format!("input field '{path}' is declared twice"));
            }
            field.kind.check(&path)?;
            if let Some(default) = &field.default {
                field
                    .kind
                    .validate(default, &path)
                    .map_err(|e| format!("default for '{path}' is invalid: {e}"))?;
            }
        }
        Ok(())
    }
}

fn join_path(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.to_string(),
    }
}
