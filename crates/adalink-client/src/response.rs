use adalink_core::types::Isn;
use adalink_types::{FieldValue, ShortName};

/// One selected field of a materialised record. Repeating fields carry one
/// entry per occurrence the server reported; `values.len()` is therefore
/// the MU/PE quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordValue {
    /// Query name: long name on map-backed requests, short name otherwise.
    pub name: String,
    pub short: ShortName,
    pub values: Vec<FieldValue>,
}

/// One record materialised from a read.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub isn: Isn,
    pub fields: Vec<RecordValue>,
}

impl Record {
    pub fn new(isn: Isn) -> Self {
        Record {
            isn,
            fields: Vec::new(),
        }
    }

    /// First value of a field, by query name.
    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.values(name).first()
    }

    /// All occurrences of a field, by query name.
    pub fn values(&self, name: &str) -> &[FieldValue] {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map_or(&[], |f| f.values.as_slice())
    }

    /// Occurrence count of a repeating field; 0 when the field is absent.
    pub fn quantity(&self, name: &str) -> usize {
        self.values(name).len()
    }

    pub fn set(&mut self, name: &str, values: Vec<FieldValue>) {
        if let Some(field) = self.fields.iter_mut().find(|f| f.name == name) {
            field.values = values;
        }
    }
}

/// Result of one read operation: records in server order plus loop
/// metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub records: Vec<Record>,
    /// ISN quantity reported by the initial search call; 0 for sequence
    /// reads.
    pub isn_quantity: u64,
    /// True when the loop stopped at the caller's limit rather than at EOF.
    pub more: bool,
}

impl Response {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
