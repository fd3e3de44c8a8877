//! Typed parameter schemas for generation models.
//!
//! Each model declares its parameters once as a tagged union of field
//! kinds; one generic validator filters caller input against it. Cost
//! multipliers and "hidden from user" flags hang off the same
//! declaration, so there is no per-field branching anywhere else.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ForgeError, Result};

/// The kind of a declared parameter field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Closed set of string values.
    Enum {
        values: Vec<String>,
        #[serde(default)]
        default: Option<String>,
    },
    /// Numeric value with an optional inclusive range.
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        default: Option<f64>,
    },
    Boolean {
        #[serde(default)]
        default: bool,
    },
    /// Free text, capped in length.
    Text {
        #[serde(default = "default_text_len")]
        max_len: usize,
    },
    /// References to uploaded files, capped in count.
    FileRef {
        #[serde(default = "default_file_count")]
        max_count: usize,
    },
}

fn default_text_len() -> usize {
    4_000
}
fn default_file_count() -> usize {
    4
}

impl FieldKind {
    fn default_value(&self) -> Option<Value> {
        match self {
            Self::Enum { default, .. } => default.clone().map(Value::String),
            Self::Number { default, .. } => default.and_then(|n| {
                serde_json::Number::from_f64(n).map(Value::Number)
            }),
            Self::Boolean { default } => Some(Value::Bool(*default)),
            Self::Text { .. } => None,
            Self::FileRef { .. } => Some(Value::Array(Vec::new())),
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub kind: FieldKind,
    /// When false the caller's value is ignored and the schema default is
    /// used, whatever the input said.
    #[serde(default = "default_true")]
    pub editable: bool,
    /// Hidden from parameter forms; still filtered and priced normally.
    #[serde(default)]
    pub hidden: bool,
}

fn default_true() -> bool {
    true
}

pub type ParamMap = BTreeMap<String, Value>;

/// Parameter schema for one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParamSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl ParamSchema {
    pub fn new(fields: BTreeMap<String, FieldSpec>) -> Self {
        Self { fields }
    }

    /// Filter caller parameters down to what the schema declares.
    ///
    /// Undeclared keys are dropped. Non-editable fields are forced to their
    /// default. Enum values absent or outside the allowed set fall back to
    /// the default, or fail validation when no default exists. Range and
    /// size constraints are enforced.
    pub fn filter(&self, params: &ParamMap) -> Result<ParamMap> {
        let mut out = ParamMap::new();

        for (name, spec) in &self.fields {
            let supplied = params.get(name);

            if !spec.editable {
                if let Some(v) = spec.kind.default_value() {
                    out.insert(name.clone(), v);
                }
                continue;
            }

            match (&spec.kind, supplied) {
                (FieldKind::Enum { values, default }, v) => {
                    let candidate = v.and_then(|v| v.as_str());
                    match candidate {
                        Some(s) if values.iter().any(|allowed| allowed == s) => {
                            out.insert(name.clone(), Value::String(s.to_string()));
                        }
                        _ => match default {
                            Some(d) => {
                                out.insert(name.clone(), Value::String(d.clone()));
                            }
                            None if candidate.is_some() => {
                                return Err(ForgeError::Validation(format!(
                                    "parameter '{name}' must be one of {values:?}"
                                )));
                            }
                            None => {}
                        },
                    }
                }
                (FieldKind::Number { min, max, .. }, Some(v)) => {
                    let n = v.as_f64().ok_or_else(|| {
                        ForgeError::Validation(format!("parameter '{name}' must be a number"))
                    })?;
                    if min.map(|m| n < m).unwrap_or(false) || max.map(|m| n > m).unwrap_or(false) {
                        return Err(ForgeError::Validation(format!(
                            "parameter '{name}' out of range {min:?}..{max:?}"
                        )));
                    }
                    out.insert(name.clone(), v.clone());
                }
                (FieldKind::Number { .. }, None) => {
                    if let Some(v) = spec.kind.default_value() {
                        out.insert(name.clone(), v);
                    }
                }
                (FieldKind::Boolean { .. }, Some(Value::Bool(b))) => {
                    out.insert(name.clone(), Value::Bool(*b));
                }
                (FieldKind::Boolean { default }, _) => {
                    out.insert(name.clone(), Value::Bool(*default));
                }
                (FieldKind::Text { max_len }, Some(v)) => {
                    let s = v.as_str().ok_or_else(|| {
                        ForgeError::Validation(format!("parameter '{name}' must be a string"))
                    })?;
                    if s.len() > *max_len {
                        return Err(ForgeError::Validation(format!(
                            "parameter '{name}' exceeds {max_len} characters"
                        )));
                    }
                    out.insert(name.clone(), v.clone());
                }
                (FieldKind::Text { .. }, None) => {}
                (FieldKind::FileRef { max_count }, Some(Value::Array(items))) => {
                    if items.len() > *max_count {
                        return Err(ForgeError::Validation(format!(
                            "parameter '{name}' allows at most {max_count} files"
                        )));
                    }
                    out.insert(name.clone(), Value::Array(items.clone()));
                }
                (FieldKind::FileRef { .. }, Some(_)) => {
                    return Err(ForgeError::Validation(format!(
                        "parameter '{name}' must be an array of file references"
                    )));
                }
                (FieldKind::FileRef { .. }, None) => {}
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParamSchema {
        let mut fields = BTreeMap::new();
        fields.insert(
            "quality".to_string(),
            FieldSpec {
                kind: FieldKind::Enum {
                    values: vec!["Standard".into(), "HD".into()],
                    default: Some("Standard".into()),
                },
                editable: true,
                hidden: false,
            },
        );
        fields.insert(
            "steps".to_string(),
            FieldSpec {
                kind: FieldKind::Number {
                    min: Some(1.0),
                    max: Some(50.0),
                    default: Some(20.0),
                },
                editable: true,
                hidden: false,
            },
        );
        fields.insert(
            "watermark".to_string(),
            FieldSpec {
                kind: FieldKind::Boolean { default: true },
                editable: false,
                hidden: true,
            },
        );
        fields.insert(
            "uploaded_image".to_string(),
            FieldSpec {
                kind: FieldKind::FileRef { max_count: 2 },
                editable: true,
                hidden: false,
            },
        );
        ParamSchema::new(fields)
    }

    fn params(v: Value) -> ParamMap {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn undeclared_keys_are_dropped() {
        let out = schema()
            .filter(&params(json!({"quality": "HD", "__proto__": "x"})))
            .unwrap();
        assert!(out.contains_key("quality"));
        assert!(!out.contains_key("__proto__"));
    }

    #[test]
    fn non_editable_fields_are_forced_to_default() {
        let out = schema()
            .filter(&params(json!({"watermark": false})))
            .unwrap();
        assert_eq!(out["watermark"], Value::Bool(true));
    }

    #[test]
    fn bad_enum_value_falls_back_to_default() {
        let out = schema()
            .filter(&params(json!({"quality": "UltraMegaHD"})))
            .unwrap();
        assert_eq!(out["quality"], Value::String("Standard".into()));
    }

    #[test]
    fn bad_enum_without_default_is_rejected() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "voice".to_string(),
            FieldSpec {
                kind: FieldKind::Enum {
                    values: vec!["alloy".into()],
                    default: None,
                },
                editable: true,
                hidden: false,
            },
        );
        let err = ParamSchema::new(fields)
            .filter(&params(json!({"voice": "nova"})))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_parameters");
    }

    #[test]
    fn number_out_of_range_is_rejected() {
        let err = schema()
            .filter(&params(json!({"steps": 500})))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_parameters");
    }

    #[test]
    fn file_count_is_capped() {
        let err = schema()
            .filter(&params(json!({"uploaded_image": ["a", "b", "c"]})))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_parameters");
    }
}
