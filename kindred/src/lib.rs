pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod guid;
pub mod hydrate;
pub mod loader;
pub mod mutation;
pub mod normalize;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod validation;

pub use config::{KindredConfig, StoreConfig};
pub use driver::{Document, Filter, IdStrategy, MemoryDriver, SqliteDriver, StoreDriver, Stores};
pub use engine::{Engine, Request};
pub use error::{ErrorKind, KindredError, Result};
pub use events::{Hooks, Operation, PostMutation, PreMutation};
pub use hydrate::{HydratedDocument, Relation};
pub use query::{Pagination, Query, Selection, SortDirection, SortField};
pub use schema::SchemaRegistry;
pub use validation::{Rule, RuleContext};
