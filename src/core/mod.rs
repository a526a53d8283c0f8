pub mod error;
pub mod path;
pub mod types;

pub use error::{OdmError, Result};
pub use path::FieldMap;
pub use types::{FieldDef, FieldType, Schema};
