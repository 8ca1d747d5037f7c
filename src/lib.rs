pub mod config;
pub mod error;
pub mod merge;
pub mod package;
pub mod pipeline;
pub mod progress;
pub mod schema;
pub mod store;
pub mod template;
pub mod values;

pub use error::{EngineError, Result};
pub use merge::engine::{MergeEngine, MergeOptions};
pub use merge::fields::{MergeContext, MergeFieldBuilder};
pub use pipeline::{GenerateRequest, Generator, TemplateMap, TemplateRegistry};
pub use schema::Schema;
pub use store::{FieldValueSource, FileSchemaStore, MemorySchemaStore, RawValues, SchemaStore};
pub use template::extract::extract;
