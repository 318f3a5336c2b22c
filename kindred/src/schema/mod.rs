mod field;
mod model;
mod parser;
mod registry;
mod types;

pub use field::{Field, FieldType, ScalarKind};
pub use model::{Model, ID_KEY};
pub use parser::{parse_schema, parse_schema_str};
pub use registry::SchemaRegistry;
pub use types::{
    FieldMap, FieldOptions, FieldSpec, IndexDefinition, IndexKind, ModelDefinition,
    OnDeletePolicy, RuleSpec, SchemaDefinition, TransformSpec,
};
