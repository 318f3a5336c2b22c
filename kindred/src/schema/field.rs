use super::types::{FieldSpec, OnDeletePolicy, RuleSpec, TransformSpec};
use crate::error::{KindredError, Result};
use crate::validation::Rule;

/// Scalar kinds a field can hold directly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    String,
    Number,
    Boolean,
    Id,
}

/// Declared type of a field, resolved once at schema load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Scalar(ScalarKind),
    Reference(String),
    Array(Box<FieldType>),
}

impl FieldType {
    /// Parse a type marker: `String`, `Number`, `Boolean`, `ID`, a model name, or `[X]`.
    pub fn parse(marker: &str) -> Result<Self> {
        let marker = marker.trim();
        if let Some(inner) = marker.strip_prefix('[').and_then(|m| m.strip_suffix(']')) {
            let element = FieldType::parse(inner)?;
            if element.is_array() {
                return Err(KindredError::Schema(format!(
                    "Nested array types are not supported: '{marker}'"
                )));
            }
            return Ok(FieldType::Array(Box::new(element)));
        }
        if marker.is_empty() {
            return Err(KindredError::Schema("Empty field type marker".into()));
        }
        Ok(match marker {
            "String" | "string" => FieldType::Scalar(ScalarKind::String),
            "Number" | "number" | "Int" | "Float" => FieldType::Scalar(ScalarKind::Number),
            "Boolean" | "boolean" => FieldType::Scalar(ScalarKind::Boolean),
            "ID" => FieldType::Scalar(ScalarKind::Id),
            model => FieldType::Reference(model.to_string()),
        })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::Array(_))
    }

    /// The element type for arrays, the type itself otherwise.
    pub fn element(&self) -> &FieldType {
        match self {
            FieldType::Array(inner) => inner,
            other => other,
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match self.element() {
            FieldType::Reference(model) => Some(model),
            _ => None,
        }
    }

    pub fn scalar(&self) -> Option<ScalarKind> {
        match self.element() {
            FieldType::Scalar(kind) => Some(*kind),
            _ => None,
        }
    }
}

/// One attribute of a model.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    /// Storage key; the alias when one is declared.
    pub key: String,
    pub field_type: FieldType,
    pub required: bool,
    pub immutable: bool,
    pub unique: bool,
    pub embedded: bool,
    /// Field on the referenced model that defines this virtual relationship.
    pub by: Option<String>,
    pub on_delete: Option<OnDeletePolicy>,
    pub transforms: Vec<TransformSpec>,
    pub rules: Vec<Rule>,
}

impl Field {
    pub fn from_spec(name: &str, spec: &FieldSpec) -> Result<Self> {
        let options = spec.options();
        let field_type = FieldType::parse(&options.field_type)?;

        let mut rules = Vec::new();
        if options.required {
            rules.push(Rule::Required);
        }
        if options.immutable {
            rules.push(Rule::Immutable);
        }
        if let Some(values) = options.enum_values {
            rules.push(Rule::Enum(values));
        }
        for rule in &options.rules {
            rules.push(match rule {
                RuleSpec::Range(min, max) => Rule::Range {
                    min: *min,
                    max: *max,
                },
                RuleSpec::Allow(values) => Rule::Allow(values.clone()),
                RuleSpec::Reject(values) => Rule::Reject(values.clone()),
                RuleSpec::Pattern(pattern) => {
                    let regex = regex::Regex::new(pattern).map_err(|e| {
                        KindredError::Schema(format!("Field '{name}' has invalid pattern: {e}"))
                    })?;
                    Rule::Pattern(regex)
                }
            });
        }

        Ok(Field {
            name: name.to_string(),
            key: options.alias.unwrap_or_else(|| name.to_string()),
            field_type,
            required: options.required,
            immutable: options.immutable,
            unique: options.unique,
            embedded: options.embedded,
            by: options.by,
            on_delete: options.on_delete,
            transforms: options.transforms,
            rules,
        })
    }

    pub fn is_array(&self) -> bool {
        self.field_type.is_array()
    }

    pub fn reference(&self) -> Option<&str> {
        self.field_type.reference()
    }

    pub fn is_virtual(&self) -> bool {
        self.by.is_some()
    }

    pub fn is_scalar(&self) -> bool {
        self.field_type.scalar().is_some()
    }

    /// A reference stored locally as ids: not virtual, not embedded.
    pub fn is_direct_reference(&self) -> bool {
        self.reference().is_some() && !self.is_virtual() && !self.embedded
    }

    /// Array relations can be rolled up into counts.
    pub fn is_countable(&self) -> bool {
        self.is_array() && self.reference().is_some() && !self.embedded
    }

    /// Selection name for this field's rollup, e.g. `chapters` -> `countChapters`.
    pub fn count_name(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => format!("count{}{}", first.to_uppercase(), chars.as_str()),
            None => "count".to_string(),
        }
    }
}
