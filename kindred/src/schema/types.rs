use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Top-level schema definition parsed from schema.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub models: HashMap<String, ModelDefinition>,
}

/// Definition of a single model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinition {
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default)]
    pub hide_from_api: bool,
    #[serde(default)]
    pub store: Option<String>,
}

/// Field specs in declaration order.
#[derive(Debug, Clone, Default)]
pub struct FieldMap(pub Vec<(String, FieldSpec)>);

impl<'de> Deserialize<'de> for FieldMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldMapVisitor;

        impl<'de> Visitor<'de> for FieldMapVisitor {
            type Value = FieldMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of field name to field spec")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FieldMap, A::Error> {
                let mut fields = Vec::new();
                while let Some((name, spec)) = access.next_entry::<String, FieldSpec>()? {
                    fields.push((name, spec));
                }
                Ok(FieldMap(fields))
            }
        }

        deserializer.deserialize_map(FieldMapVisitor)
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, spec) in &self.0 {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }
}

/// A field is either a bare type marker (`String`, `Person`, `[Chapter]`)
/// or a full options object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    Marker(String),
    Detailed(Box<FieldOptions>),
}

impl FieldSpec {
    pub fn options(&self) -> FieldOptions {
        match self {
            FieldSpec::Marker(marker) => FieldOptions {
                field_type: marker.clone(),
                ..FieldOptions::default()
            },
            FieldSpec::Detailed(options) => (**options).clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOptions {
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub embedded: bool,
    #[serde(default)]
    pub by: Option<String>,
    #[serde(default)]
    pub on_delete: Option<OnDeletePolicy>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub transforms: Vec<TransformSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// Value rewrites applied on write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformSpec {
    Trim,
    Lowercase,
    Uppercase,
    Dedupe,
}

/// Declarative validation rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSpec {
    Range(Option<f64>, Option<f64>),
    Allow(Vec<serde_json::Value>),
    Reject(Vec<serde_json::Value>),
    Pattern(String),
}

/// On-delete referential integrity policy, declared on the referencing field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDeletePolicy {
    Cascade,
    Nullify,
    Restrict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: IndexKind,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Unique,
    #[default]
    Secondary,
}
