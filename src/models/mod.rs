//! Model catalog domain: GGUF header scanning and the persisted model list.

mod catalog;
mod file_types;
pub mod gguf;

pub use catalog::{scan_model, CatalogError, ModelCatalog, ModelEntry, FIELD_ERROR, FIELD_UNKNOWN};
pub use file_types::{file_type_name, weight_format_label};
