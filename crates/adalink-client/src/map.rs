use std::path::Path;

use adalink_core::error::{ConstraintError, Error};
use adalink_core::types::{Fnr, Isn};
use adalink_types::{Fdt, FieldFormat, ShortName};
use serde::{Deserialize, Serialize};

/// Entry flag bits carried in the persisted map record.
pub const FLAG_ISN: u8 = 0x01;
pub const FLAG_KEY: u8 = 0x02;
pub const FLAG_MU: u8 = 0x04;
pub const FLAG_PE: u8 = 0x08;
pub const FLAG_IGNORE: u8 = 0x10;

/// Fixed widths of the map record fields (RN name, RA target).
const NAME_LEN: usize = 32;
const TARGET_LEN: usize = 64;

/// One long-name projection over an FDT field, with optional format and
/// length overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapField {
    pub long_name: String,
    pub short: ShortName,
    pub format: FieldFormat,
    pub length: u32,
    pub flags: u8,
    /// Free-form note; kept in JSON exports, not in the record blob.
    #[serde(default)]
    pub remark: String,
}

impl MapField {
    pub fn new(long_name: &str, short: ShortName, format: FieldFormat, length: u32) -> Self {
        MapField {
            long_name: long_name.to_string(),
            short,
            format,
            length,
            flags: 0,
            remark: String::new(),
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_ignored(&self) -> bool {
        self.flags & FLAG_IGNORE != 0
    }

    pub fn binds_isn(&self) -> bool {
        self.flags & FLAG_ISN != 0
    }

    pub fn repeats(&self) -> bool {
        self.flags & (FLAG_MU | FLAG_PE) != 0
    }
}

/// A named projection over one file: long names, overrides and the target
/// the map belongs to. Immutable once loaded from its repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Map {
    pub name: String,
    /// Serialised URL of the database the mapped file lives in.
    pub target: String,
    pub fnr: Fnr,
    pub fields: Vec<MapField>,
    /// Repository record ISN once the map has been stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isn: Option<Isn>,
}

impl Map {
    pub fn new(name: &str, target: &str, fnr: Fnr) -> Self {
        Map {
            name: name.to_string(),
            target: target.to_string(),
            fnr,
            fields: Vec::new(),
            isn: None,
        }
    }

    pub fn add_field(&mut self, field: MapField) {
        self.fields.push(field);
    }

    pub fn field(&self, long_name: &str) -> Option<&MapField> {
        self.fields.iter().find(|f| f.long_name == long_name)
    }

    pub fn field_by_short(&self, short: ShortName) -> Option<&MapField> {
        self.fields.iter().find(|f| f.short == short)
    }

    /// A map is valid against an FDT iff every non-ignored entry that is
    /// not an ISN binding names a short name present in the table.
    pub fn validate(&self, fdt: &Fdt) -> Result<(), Error> {
        for field in &self.fields {
            if field.is_ignored() || field.binds_isn() {
                continue;
            }
            if !fdt.contains(field.short) {
                return Err(ConstraintError::UnknownShortName {
                    map: self.name.clone(),
                    field: field.long_name.clone(),
                    short_name: field.short.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Serialise into the repository record image: RN (name, alpha 32),
    /// RA (target, alpha 64), RB (file number), RF (entry count), RD
    /// (entry blob).
    pub fn to_record_bytes(&self) -> Vec<u8> {
        let mut record = Vec::with_capacity(NAME_LEN + TARGET_LEN + 8 + self.fields.len() * 16);
        record.extend_from_slice(&padded(&self.name, NAME_LEN));
        record.extend_from_slice(&padded(&self.target, TARGET_LEN));
        record.extend_from_slice(&self.fnr.0.to_le_bytes());
        record.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for field in &self.fields {
            let long = field.long_name.as_bytes();
            record.extend_from_slice(&(long.len() as u16).to_le_bytes());
            record.extend_from_slice(long);
            record.extend_from_slice(&field.short.bytes());
            record.push(field.format.code() as u8);
            record.extend_from_slice(&(field.length as u16).to_le_bytes());
            record.push(field.flags);
        }
        record
    }

    /// Parse a repository record. Trailing bytes after the last declared
    /// entry are tolerated, older readers can skip newer fields.
    pub fn from_record_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < NAME_LEN + TARGET_LEN + 8 {
            return Err(malformed("record shorter than the fixed header"));
        }
        let name = trimmed(&bytes[..NAME_LEN]);
        let target = trimmed(&bytes[NAME_LEN..NAME_LEN + TARGET_LEN]);
        let mut at = NAME_LEN + TARGET_LEN;
        let fnr = Fnr(u32::from_le_bytes([
            bytes[at],
            bytes[at + 1],
            bytes[at + 2],
            bytes[at + 3],
        ]));
        at += 4;
        let count = u32::from_le_bytes([
            bytes[at],
            bytes[at + 1],
            bytes[at + 2],
            bytes[at + 3],
        ]) as usize;
        at += 4;

        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            if at + 2 > bytes.len() {
                return Err(malformed("entry blob truncated at a long-name length"));
            }
            let long_len = u16::from_le_bytes([bytes[at], bytes[at + 1]]) as usize;
            at += 2;
            if at + long_len + 6 > bytes.len() {
                return Err(malformed("entry blob truncated inside an entry"));
            }
            let long_name = String::from_utf8(bytes[at..at + long_len].to_vec())
                .map_err(|_| malformed("long name is not UTF-8"))?;
            at += long_len;
            let short = ShortName::new([bytes[at], bytes[at + 1]]);
            at += 2;
            let format = FieldFormat::from_code(bytes[at] as char)
                .ok_or_else(|| malformed("unknown field format code"))?;
            at += 1;
            let length = u32::from(u16::from_le_bytes([bytes[at], bytes[at + 1]]));
            at += 2;
            let flags = bytes[at];
            at += 1;
            fields.push(MapField {
                long_name,
                short,
                format,
                length,
                flags,
                remark: String::new(),
            });
        }

        Ok(Map {
            name,
            target,
            fnr,
            fields,
            isn: None,
        })
    }

    /// Export as pretty-printed JSON, the interchange form used to move
    /// maps between repositories.
    pub fn export_json(&self, path: &Path) -> Result<(), Error> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| malformed_owned(format!("JSON encode failed: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn import_json(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let mut map: Map = serde_json::from_str(&text)
            .map_err(|e| malformed_owned(format!("JSON decode failed: {e}")))?;
        // Imported maps are not stored until added to a repository.
        map.isn = None;
        Ok(map)
    }
}

fn malformed(reason: &str) -> Error {
    malformed_owned(reason.to_string())
}

fn malformed_owned(reason: String) -> Error {
    ConstraintError::MalformedMapRecord { reason }.into()
}

fn padded(text: &str, width: usize) -> Vec<u8> {
    let mut out = vec![b' '; width];
    let bytes = text.as_bytes();
    let n = bytes.len().min(width);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use adalink_types::{fdt, FieldFlags};

    fn employee_map() -> Map {
        let mut map = Map::new("EmployeeMap", "acj;target=24", Fnr(11));
        map.add_field(MapField::new(
            "Id",
            "AA".parse().unwrap(),
            FieldFormat::Alpha,
            8,
        ));
        map.add_field(MapField::new(
            "FirstName",
            "AC".parse().unwrap(),
            FieldFormat::Alpha,
            20,
        ));
        map.add_field(MapField::new(
            "LastName",
            "AE".parse().unwrap(),
            FieldFormat::Alpha,
            20,
        ));
        map.add_field(
            MapField::new("Salary", "AS".parse().unwrap(), FieldFormat::Packed, 6)
                .with_flags(FLAG_PE),
        );
        map
    }

    fn employee_fdt() -> Fdt {
        Fdt::from_entries(
            Fnr(11),
            vec![
                fdt::scalar("AA", 8, FieldFormat::Alpha, FieldFlags::DESCRIPTOR),
                fdt::scalar("AC", 20, FieldFormat::Alpha, 0),
                fdt::scalar("AE", 20, FieldFormat::Alpha, FieldFlags::DESCRIPTOR),
                fdt::scalar("AS", 6, FieldFormat::Packed, FieldFlags::MU),
            ],
        )
        .unwrap()
    }

    #[test]
    fn record_bytes_round_trip() {
        let map = employee_map();
        let bytes = map.to_record_bytes();
        let parsed = Map::from_record_bytes(&bytes).unwrap();
        assert_eq!(parsed.name, "EmployeeMap");
        assert_eq!(parsed.target, "acj;target=24");
        assert_eq!(parsed.fnr, Fnr(11));
        assert_eq!(parsed.fields, map.fields);
    }

    #[test]
    fn trailing_bytes_tolerated() {
        let mut bytes = employee_map().to_record_bytes();
        bytes.extend_from_slice(b"future-extension");
        let parsed = Map::from_record_bytes(&bytes).unwrap();
        assert_eq!(parsed.fields.len(), 4);
    }

    #[test]
    fn truncated_blob_rejected() {
        let bytes = employee_map().to_record_bytes();
        let err = Map::from_record_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(
            err,
            Error::Constraint(ConstraintError::MalformedMapRecord { .. })
        ));
    }

    #[test]
    fn validation_follows_the_fdt() {
        let fdt = employee_fdt();
        let mut map = employee_map();
        map.validate(&fdt).unwrap();

        map.add_field(MapField::new(
            "Bonus",
            "ZZ".parse().unwrap(),
            FieldFormat::Packed,
            6,
        ));
        let err = map.validate(&fdt).unwrap_err();
        assert!(matches!(
            err,
            Error::Constraint(ConstraintError::UnknownShortName { .. })
        ));

        // Ignored entries are exempt.
        if let Some(last) = map.fields.last_mut() {
            last.flags |= FLAG_IGNORE;
        }
        map.validate(&fdt).unwrap();
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("employee-map.json");
        let map = employee_map();
        map.export_json(&path).unwrap();
        let loaded = Map::import_json(&path).unwrap();
        assert_eq!(loaded, map);
    }
}
