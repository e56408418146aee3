//! Field-level data model of the client: FDT parsing, typed field values
//! with their binary encodings, field-query compilation into format buffers
//! and search-expression compilation into search/value buffers.

pub mod fdt;
pub mod query;
pub mod search;
pub mod value;

pub use fdt::{FdtField, FieldFlags, FieldFormat, Fdt, ShortName};
pub use query::{FieldQuery, FormatSpec, QueryField, Slot, SlotKind};
pub use search::{Connective, SearchOp, SearchTerm, SearchTree};
pub use value::FieldValue;
