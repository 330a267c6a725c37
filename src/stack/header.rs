//! Stack-level metadata as a validated key/value header.
//!
//! File formats declare the fields they understand, how values are checked
//! and coerced, and which fields callers may change. The header holds JSON
//! values so formats can persist it directly.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// Header values are JSON values; formats serialize them as-is.
pub type HeaderValue = Value;

/// How a declared field's values are checked and coerced.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    /// Any JSON value.
    Any,
    /// A string; scalars are coerced via their display form.
    Str,
    /// A boolean; the strings "true"/"false" are accepted.
    Bool,
    /// An integer, optionally bounded inclusively; numeric strings are
    /// accepted.
    Int { min: Option<i64>, max: Option<i64> },
    /// Exactly this value, always.
    Fixed(HeaderValue),
}

impl FieldRule {
    /// Check `value` against the rule, coercing where allowed. Returns the
    /// canonical value.
    fn cast(&self, field: &str, value: HeaderValue) -> Result<HeaderValue> {
        let fail = |message: String| Error::InvalidFieldValue {
            field: field.to_string(),
            message,
        };
        match self {
            FieldRule::Any => Ok(value),
            FieldRule::Str => match value {
                Value::String(_) => Ok(value),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(fail(format!("expected a string, got {other}"))),
            },
            FieldRule::Bool => match value {
                Value::Bool(_) => Ok(value),
                Value::String(s) => match s.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(fail(format!("expected a boolean, got \"{s}\""))),
                },
                other => Err(fail(format!("expected a boolean, got {other}"))),
            },
            FieldRule::Int { min, max } => {
                let n = match &value {
                    Value::Number(n) => n
                        .as_i64()
                        .ok_or_else(|| fail(format!("expected an integer, got {value}")))?,
                    Value::String(s) => s
                        .parse::<i64>()
                        .map_err(|_| fail(format!("expected an integer, got \"{s}\"")))?,
                    other => {
                        return Err(fail(format!("expected an integer, got {other}")));
                    }
                };
                if let Some(min) = min {
                    if n < *min {
                        return Err(fail(format!("{n} is below the minimum {min}")));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return Err(fail(format!("{n} is above the maximum {max}")));
                    }
                }
                Ok(Value::from(n))
            }
            FieldRule::Fixed(expected) => {
                if &value == expected {
                    Ok(value)
                } else {
                    Err(fail(format!("must be {expected}, got {value}")))
                }
            }
        }
    }
}

/// A declared header field.
#[derive(Debug, Clone)]
pub struct Field {
    rule: FieldRule,
    read_only: bool,
    optional: bool,
}

impl Field {
    pub fn new(rule: FieldRule) -> Field {
        Field {
            rule,
            read_only: false,
            optional: true,
        }
    }

    /// Callers may not set or remove this field; only the format itself
    /// maintains it.
    pub fn read_only(mut self) -> Field {
        self.read_only = true;
        self
    }

    /// The field must always be present.
    pub fn required(mut self) -> Field {
        self.optional = false;
        self
    }
}

/// Whether fields outside the declared set may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRule {
    /// Only declared fields.
    DeclaredOnly,
    /// Undeclared fields allowed if their names are lowercase
    /// alphanumeric/underscore and do not start with a digit.
    Lowercase,
    /// Any field name.
    Any,
}

impl NameRule {
    fn check(&self, name: &str, declared: bool) -> Result<()> {
        if declared {
            return Ok(());
        }
        let ok = match self {
            NameRule::DeclaredOnly => false,
            NameRule::Any => !name.is_empty(),
            NameRule::Lowercase => {
                !name.is_empty()
                    && !name.starts_with(|c: char| c.is_ascii_digit())
                    && name
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::UnknownField {
                field: name.to_string(),
            })
        }
    }
}

/// Validated stack metadata.
///
/// Construct with the declared field set via [`Header::new`], then load
/// existing data with [`Header::with_data`]. `set`/`remove` enforce the
/// declared rules; the depth field, when declared, is maintained by the
/// owning stack through [`Header::update_depth`].
#[derive(Debug, Clone)]
pub struct Header {
    fields: BTreeMap<String, Field>,
    data: BTreeMap<String, HeaderValue>,
    name_rule: NameRule,
    depth_field: Option<&'static str>,
    read_only: bool,
}

impl Header {
    pub fn new(fields: BTreeMap<String, Field>, name_rule: NameRule) -> Header {
        Header {
            fields,
            data: BTreeMap::new(),
            name_rule,
            depth_field: None,
            read_only: false,
        }
    }

    /// Declare which field mirrors the stack depth. It is kept in sync by
    /// the owning stack across inserts and deletes.
    pub fn with_depth_field(mut self, name: &'static str) -> Header {
        self.depth_field = Some(name);
        self
    }

    pub fn read_only(mut self) -> Header {
        self.read_only = true;
        self
    }

    /// Load existing data, validating every entry and checking that all
    /// required fields are present. Values are coerced to canonical form.
    pub fn with_data(mut self, data: BTreeMap<String, HeaderValue>) -> Result<Header> {
        for (name, value) in data {
            let field = self.fields.get(&name);
            self.name_rule.check(&name, field.is_some())?;
            let value = match field {
                Some(f) => f.rule.cast(&name, value)?,
                None => value,
            };
            self.data.insert(name, value);
        }
        for (name, field) in &self.fields {
            if !field.optional && !self.data.contains_key(name) {
                return Err(Error::MissingField {
                    field: name.clone(),
                });
            }
        }
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.data.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate over all entries in name order.
    pub fn items(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Set a field, enforcing writability, the name rule and the field's
    /// value rule. The stored value is the canonical coercion.
    pub fn set(&mut self, name: &str, value: HeaderValue) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let field = self.fields.get(name);
        self.name_rule.check(name, field.is_some())?;
        let value = match field {
            Some(f) => {
                if f.read_only {
                    return Err(Error::ReadOnlyField {
                        field: name.to_string(),
                    });
                }
                f.rule.cast(name, value)?
            }
            None => value,
        };
        self.data.insert(name.to_string(), value);
        Ok(())
    }

    /// Remove a field. Required and read-only fields cannot be removed.
    pub fn remove(&mut self, name: &str) -> Result<Option<HeaderValue>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if let Some(field) = self.fields.get(name) {
            if field.read_only {
                return Err(Error::ReadOnlyField {
                    field: name.to_string(),
                });
            }
            if !field.optional {
                return Err(Error::MissingField {
                    field: name.to_string(),
                });
            }
        }
        Ok(self.data.remove(name))
    }

    /// Write the depth field, bypassing read-only protection. Called by the
    /// owning stack after every depth change; a no-op when no depth field
    /// is declared.
    pub(crate) fn update_depth(&mut self, depth: usize) {
        if let Some(name) = self.depth_field {
            self.data.insert(name.to_string(), Value::from(depth));
        }
    }

    /// Raw data map, for formats persisting the header.
    pub(crate) fn data(&self) -> &BTreeMap<String, HeaderValue> {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared() -> BTreeMap<String, Field> {
        let mut fields = BTreeMap::new();
        fields.insert(
            "format".to_string(),
            Field::new(FieldRule::Fixed(json!("npy"))).read_only().required(),
        );
        fields.insert(
            "depth".to_string(),
            Field::new(FieldRule::Int {
                min: Some(0),
                max: None,
            })
            .read_only()
            .required(),
        );
        fields.insert(
            "note".to_string(),
            Field::new(FieldRule::Str),
        );
        fields
    }

    fn base_data() -> BTreeMap<String, HeaderValue> {
        let mut data = BTreeMap::new();
        data.insert("format".to_string(), json!("npy"));
        data.insert("depth".to_string(), json!(3));
        data
    }

    #[test]
    fn test_with_data_requires_fields() {
        let err = Header::new(declared(), NameRule::DeclaredOnly)
            .with_data(BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::MissingField { .. }));

        let header = Header::new(declared(), NameRule::DeclaredOnly)
            .with_data(base_data())
            .unwrap();
        assert_eq!(header.get("depth"), Some(&json!(3)));
    }

    #[test]
    fn test_set_respects_rules() {
        let mut header = Header::new(declared(), NameRule::DeclaredOnly)
            .with_data(base_data())
            .unwrap();

        header.set("note", json!(42)).unwrap();
        assert_eq!(header.get("note"), Some(&json!("42")));

        assert!(matches!(
            header.set("depth", json!(9)),
            Err(Error::ReadOnlyField { .. })
        ));
        assert!(matches!(
            header.set("mystery", json!(1)),
            Err(Error::UnknownField { .. })
        ));
        assert!(matches!(
            header.remove("format"),
            Err(Error::ReadOnlyField { .. })
        ));
    }

    #[test]
    fn test_int_rule_coercion_and_bounds() {
        let rule = FieldRule::Int {
            min: Some(0),
            max: Some(10),
        };
        assert_eq!(rule.cast("n", json!("7")).unwrap(), json!(7));
        assert!(rule.cast("n", json!(-1)).is_err());
        assert!(rule.cast("n", json!(11)).is_err());
        assert!(rule.cast("n", json!("x")).is_err());
    }

    #[test]
    fn test_lowercase_name_rule() {
        let mut header = Header::new(BTreeMap::new(), NameRule::Lowercase)
            .with_data(BTreeMap::new())
            .unwrap();
        header.set("my_field2", json!(1)).unwrap();
        assert!(header.set("MyField", json!(1)).is_err());
        assert!(header.set("2nd", json!(1)).is_err());
        assert!(header.set("", json!(1)).is_err());
    }

    #[test]
    fn test_read_only_header_rejects_writes() {
        let mut header = Header::new(BTreeMap::new(), NameRule::Any)
            .read_only()
            .with_data(BTreeMap::new())
            .unwrap();
        assert!(matches!(header.set("a", json!(1)), Err(Error::ReadOnly)));
        // no depth field declared, update_depth is a no-op
        header.update_depth(5);
        assert_eq!(header.get("depth"), None);
    }

    #[test]
    fn test_depth_field_maintained() {
        let mut header = Header::new(declared(), NameRule::DeclaredOnly)
            .with_depth_field("depth")
            .with_data(base_data())
            .unwrap();
        header.update_depth(7);
        assert_eq!(header.get("depth"), Some(&json!(7)));
    }
}
