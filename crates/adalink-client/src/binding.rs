use adalink_core::error::{ConfigError, ConstraintError, Error};
use adalink_core::types::{Fnr, Isn};
use adalink_types::{Fdt, FieldFormat, FieldValue, ShortName};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map as JsonMap, Number, Value};

use crate::map::{Map, MapField, FLAG_IGNORE, FLAG_ISN, FLAG_KEY, FLAG_MU, FLAG_PE};
use crate::response::{Record, RecordValue};

/// Parsed form of one binding tag. Grammar:
/// `<rename>:<options>:<shortname>` with the leading segments optional,
/// options drawn from `isn`, `key`, `ignore`. `key:AE` is the two-segment
/// form; a bare `isn`/`key`/`ignore` is an option alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSpec {
    pub rename: Option<String>,
    pub short: Option<ShortName>,
    pub is_isn: bool,
    pub is_key: bool,
    pub ignore: bool,
}

impl TagSpec {
    pub fn parse(tag: &str) -> Result<Self, Error> {
        let mut spec = TagSpec::default();
        if tag.is_empty() {
            return Ok(spec);
        }
        let parts: Vec<&str> = tag.split(':').collect();
        let (rename, options, short) = match parts.as_slice() {
            [single] => {
                if is_option(single) {
                    ("", *single, "")
                } else {
                    ("", "", *single)
                }
            }
            [options, short] => ("", *options, *short),
            [rename, options, short] => (*rename, *options, *short),
            _ => {
                return Err(bad_tag(tag));
            }
        };
        if !rename.is_empty() {
            spec.rename = Some(rename.to_string());
        }
        for option in options.split(',').filter(|o| !o.is_empty()) {
            match option {
                "isn" => spec.is_isn = true,
                "key" => spec.is_key = true,
                "ignore" => spec.ignore = true,
                _ => return Err(bad_tag(tag)),
            }
        }
        if !short.is_empty() {
            spec.short = Some(short.parse()?);
        }
        Ok(spec)
    }
}

fn is_option(word: &str) -> bool {
    matches!(word, "isn" | "key" | "ignore")
}

fn bad_tag(tag: &str) -> Error {
    ConfigError::MalformedUrl {
        reason: format!("invalid binding tag: {tag:?}"),
    }
    .into()
}

/// Shape of one described field. Sequences repeat: a scalar sequence is an
/// MU field, a group sequence a PE group.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Scalar { format: FieldFormat, length: u32 },
    ScalarSeq { format: FieldFormat, length: u32 },
    Group(Vec<TypeField>),
    GroupSeq(Vec<TypeField>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeField {
    pub name: String,
    pub tag: TagSpec,
    pub kind: FieldKind,
}

/// A nominal description of a user record shape, built once per type and
/// reused for every marshal. Produces a dynamic map plus the record↔JSON
/// marshal pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeInfo {
    pub name: String,
    pub fields: Vec<TypeField>,
}

impl TypeInfo {
    pub fn new(name: &str) -> Self {
        TypeInfo {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    /// Describe one field. The tag decides the short name and options.
    pub fn field(mut self, name: &str, tag: &str, kind: FieldKind) -> Result<Self, Error> {
        self.fields.push(TypeField {
            name: name.to_string(),
            tag: TagSpec::parse(tag)?,
            kind,
        });
        Ok(self)
    }

    /// Derive the dynamic map this description represents.
    pub fn to_map(&self, target: &str, fnr: Fnr) -> Result<Map, Error> {
        let mut map = Map::new(&self.name, target, fnr);
        collect_entries(&self.fields, 0, &mut map)?;
        Ok(map)
    }

    /// Every non-ignored leaf must resolve in the FDT.
    pub fn validate(&self, target: &str, fdt: &Fdt) -> Result<(), Error> {
        self.to_map(target, fdt.fnr)?.validate(fdt)
    }

    /// Materialised record -> JSON object keyed by described field names.
    pub fn record_to_value(&self, record: &Record) -> Result<Value, Error> {
        let mut object = JsonMap::new();
        for field in &self.fields {
            if field.tag.ignore {
                continue;
            }
            let key = field
                .tag
                .rename
                .clone()
                .unwrap_or_else(|| field.name.clone());
            let value = match &field.kind {
                FieldKind::Scalar { .. } => {
                    if field.tag.is_isn {
                        Value::Number(Number::from(record.isn.0))
                    } else {
                        record
                            .values(&field.name)
                            .first()
                            .map_or(Value::Null, scalar_to_json)
                    }
                }
                FieldKind::ScalarSeq { .. } => Value::Array(
                    record
                        .values(&field.name)
                        .iter()
                        .map(scalar_to_json)
                        .collect(),
                ),
                FieldKind::Group(children) => group_to_value(children, record, 0)?,
                FieldKind::GroupSeq(children) => {
                    let quantity = children
                        .first()
                        .map_or(0, |c| record.quantity(&c.name));
                    let mut rows = Vec::with_capacity(quantity);
                    for occurrence in 0..quantity {
                        rows.push(group_to_value(children, record, occurrence)?);
                    }
                    Value::Array(rows)
                }
            };
            object.insert(key, value);
        }
        Ok(Value::Object(object))
    }

    /// JSON object -> record shaped like this description, carrying `isn`
    /// from an isn-tagged field when present.
    pub fn value_to_record(&self, value: &Value) -> Result<Record, Error> {
        let object = value
            .as_object()
            .ok_or_else(|| malformed("expected a JSON object"))?;
        let mut record = Record::new(Isn(0));
        for field in &self.fields {
            if field.tag.ignore {
                continue;
            }
            let key = field.tag.rename.as_deref().unwrap_or(&field.name);
            let entry = object.get(key);
            match &field.kind {
                FieldKind::Scalar { format, .. } => {
                    if field.tag.is_isn {
                        if let Some(isn) = entry.and_then(Value::as_u64) {
                            record.isn = Isn(isn);
                        }
                        continue;
                    }
                    let values = match entry {
                        Some(v) if !v.is_null() => vec![json_to_scalar(v, *format)?],
                        _ => Vec::new(),
                    };
                    push_field(&mut record, field, values)?;
                }
                FieldKind::ScalarSeq { format, .. } => {
                    let items = entry
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(json_to_scalar(item, *format)?);
                    }
                    push_field(&mut record, field, values)?;
                }
                FieldKind::Group(children) => {
                    let inner = entry.cloned().unwrap_or(Value::Null);
                    group_from_value(children, &inner, &mut record)?;
                }
                FieldKind::GroupSeq(children) => {
                    let rows = entry
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    seq_from_values(children, rows, &mut record)?;
                }
            }
        }
        Ok(record)
    }

    /// Typed decode through serde: record -> user type.
    pub fn record_to<T: DeserializeOwned>(&self, record: &Record) -> Result<T, Error> {
        let value = self.record_to_value(record)?;
        serde_json::from_value(value)
            .map_err(|e| malformed(&format!("binding decode failed: {e}")))
    }

    /// Typed encode through serde: user value -> record.
    pub fn record_from<T: Serialize>(&self, user: &T) -> Result<Record, Error> {
        let value = serde_json::to_value(user)
            .map_err(|e| malformed(&format!("binding encode failed: {e}")))?;
        self.value_to_record(&value)
    }
}

fn collect_entries(fields: &[TypeField], group_flags: u8, map: &mut Map) -> Result<(), Error> {
    for field in fields {
        match &field.kind {
            FieldKind::Scalar { format, length } => {
                map.add_field(leaf_entry(field, *format, *length, group_flags)?);
            }
            FieldKind::ScalarSeq { format, length } => {
                map.add_field(leaf_entry(field, *format, *length, group_flags | FLAG_MU)?);
            }
            FieldKind::Group(children) => collect_entries(children, group_flags, map)?,
            FieldKind::GroupSeq(children) => {
                collect_entries(children, group_flags | FLAG_PE, map)?;
            }
        }
    }
    Ok(())
}

fn leaf_entry(
    field: &TypeField,
    format: FieldFormat,
    length: u32,
    group_flags: u8,
) -> Result<MapField, Error> {
    let mut flags = group_flags;
    if field.tag.ignore {
        flags |= FLAG_IGNORE;
    }
    if field.tag.is_isn {
        flags |= FLAG_ISN;
    }
    if field.tag.is_key {
        flags |= FLAG_KEY;
    }
    let short = match field.tag.short {
        Some(short) => short,
        // ISN bindings and ignored fields need no wire name.
        None if field.tag.is_isn || field.tag.ignore => ShortName::new(*b"00"),
        None => {
            return Err(ConfigError::UnknownField {
                name: field.name.clone(),
            }
            .into())
        }
    };
    Ok(MapField::new(&field.name, short, format, length).with_flags(flags))
}

fn group_to_value(children: &[TypeField], record: &Record, occurrence: usize) -> Result<Value, Error> {
    let mut object = JsonMap::new();
    for child in children {
        if child.tag.ignore {
            continue;
        }
        let key = child
            .tag
            .rename
            .clone()
            .unwrap_or_else(|| child.name.clone());
        let value = record
            .values(&child.name)
            .get(occurrence)
            .map_or(Value::Null, scalar_to_json);
        object.insert(key, value);
    }
    Ok(Value::Object(object))
}

fn group_from_value(children: &[TypeField], value: &Value, record: &mut Record) -> Result<(), Error> {
    for child in children {
        if child.tag.ignore {
            continue;
        }
        let FieldKind::Scalar { format, .. } = child.kind else {
            return Err(malformed("nested groups inside groups are not described"));
        };
        let key = child.tag.rename.as_deref().unwrap_or(&child.name);
        let entry = value.get(key);
        let values = match entry {
            Some(v) if !v.is_null() => vec![json_to_scalar(v, format)?],
            _ => Vec::new(),
        };
        push_field(record, child, values)?;
    }
    Ok(())
}

/// PE rows: one value per child per occurrence, in row order.
fn seq_from_values(children: &[TypeField], rows: &[Value], record: &mut Record) -> Result<(), Error> {
    for child in children {
        if child.tag.ignore {
            continue;
        }
        let FieldKind::Scalar { format, .. } = child.kind else {
            return Err(malformed("PE rows must contain scalar fields"));
        };
        let key = child.tag.rename.as_deref().unwrap_or(&child.name);
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = row.get(key).cloned().unwrap_or(Value::Null);
            if !entry.is_null() {
                values.push(json_to_scalar(&entry, format)?);
            }
        }
        push_field(record, child, values)?;
    }
    Ok(())
}

fn push_field(record: &mut Record, field: &TypeField, values: Vec<FieldValue>) -> Result<(), Error> {
    let short = field.tag.short.ok_or_else(|| ConfigError::UnknownField {
        name: field.name.clone(),
    })?;
    record.fields.push(RecordValue {
        name: field.name.clone(),
        short,
        values,
    });
    Ok(())
}

fn scalar_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Alpha(s) | FieldValue::Unicode(s) => Value::String(s.clone()),
        FieldValue::Int(v) | FieldValue::Packed(v) | FieldValue::Unpacked(v) => {
            Value::Number(Number::from(*v))
        }
        FieldValue::Uint(v) => Value::Number(Number::from(*v)),
        FieldValue::Float(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
        FieldValue::Binary(bytes) => {
            Value::Array(bytes.iter().map(|b| Value::Number(Number::from(*b))).collect())
        }
        FieldValue::Lob { size } => Value::Number(Number::from(*size)),
    }
}

fn json_to_scalar(value: &Value, format: FieldFormat) -> Result<FieldValue, Error> {
    let scalar = match format {
        FieldFormat::Alpha => FieldValue::Alpha(expect_string(value)?),
        FieldFormat::Unicode => FieldValue::Unicode(expect_string(value)?),
        FieldFormat::Fixed => FieldValue::Int(expect_int(value)?),
        FieldFormat::Packed => FieldValue::Packed(expect_int(value)?),
        FieldFormat::Unpacked => FieldValue::Unpacked(expect_int(value)?),
        FieldFormat::Float => FieldValue::Float(
            value
                .as_f64()
                .ok_or_else(|| malformed("expected a number"))?,
        ),
        FieldFormat::Binary => {
            let items = value
                .as_array()
                .ok_or_else(|| malformed("expected a byte array"))?;
            let mut bytes = Vec::with_capacity(items.len());
            for item in items {
                let byte = item
                    .as_u64()
                    .filter(|b| *b <= u64::from(u8::MAX))
                    .ok_or_else(|| malformed("expected a byte"))?;
                bytes.push(byte as u8);
            }
            FieldValue::Binary(bytes)
        }
    };
    Ok(scalar)
}

fn expect_string(value: &Value) -> Result<String, Error> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| malformed("expected a string"))
}

fn expect_int(value: &Value) -> Result<i64, Error> {
    value
        .as_i64()
        .ok_or_else(|| malformed("expected an integer"))
}

fn malformed(reason: &str) -> Error {
    ConstraintError::MalformedMapRecord {
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn employee_info() -> TypeInfo {
        TypeInfo::new("Employee")
            .field(
                "Id",
                "isn",
                FieldKind::Scalar {
                    format: FieldFormat::Fixed,
                    length: 8,
                },
            )
            .unwrap()
            .field(
                "Name",
                "key:AE",
                FieldKind::Scalar {
                    format: FieldFormat::Alpha,
                    length: 20,
                },
            )
            .unwrap()
            .field(
                "Salary",
                "::AS",
                FieldKind::ScalarSeq {
                    format: FieldFormat::Packed,
                    length: 6,
                },
            )
            .unwrap()
    }

    #[test]
    fn tag_grammar() {
        assert_eq!(
            TagSpec::parse("::AS").unwrap(),
            TagSpec {
                short: Some("AS".parse().unwrap()),
                ..TagSpec::default()
            }
        );
        let key = TagSpec::parse("key:AE").unwrap();
        assert!(key.is_key);
        assert_eq!(key.short, Some("AE".parse().unwrap()));
        assert!(TagSpec::parse("isn").unwrap().is_isn);
        assert!(TagSpec::parse("ignore").unwrap().ignore);
        assert!(TagSpec::parse("bogus:AE").is_err());
    }

    #[test]
    fn derived_map_carries_flags() {
        let map = employee_info().to_map("acj;target=24", Fnr(11)).unwrap();
        let name = map.field("Name").unwrap();
        assert_eq!(name.flags & FLAG_KEY, FLAG_KEY);
        let salary = map.field("Salary").unwrap();
        assert_eq!(salary.flags & FLAG_MU, FLAG_MU);
        let id = map.field("Id").unwrap();
        assert_eq!(id.flags & FLAG_ISN, FLAG_ISN);
    }

    #[test]
    fn mu_sequence_round_trips_through_serde() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Employee {
            #[serde(rename = "Id")]
            id: u64,
            #[serde(rename = "Name")]
            name: String,
            #[serde(rename = "Salary")]
            salary: Vec<i64>,
        }

        let info = employee_info();
        let mut record = Record::new(Isn(77));
        record.fields.push(RecordValue {
            name: "Name".to_string(),
            short: "AE".parse().unwrap(),
            values: vec![FieldValue::Alpha("SMITH".to_string())],
        });
        record.fields.push(RecordValue {
            name: "Salary".to_string(),
            short: "AS".parse().unwrap(),
            values: vec![
                FieldValue::Packed(12345),
                FieldValue::Packed(67890),
                FieldValue::Packed(11111),
            ],
        });

        let employee: Employee = info.record_to(&record).unwrap();
        assert_eq!(employee.id, 77);
        assert_eq!(employee.salary, vec![12345, 67890, 11111]);

        let back = info.record_from(&employee).unwrap();
        assert_eq!(back.isn, Isn(77));
        assert_eq!(back.quantity("Salary"), 3);
        assert_eq!(back.value("Name"), Some(&FieldValue::Alpha("SMITH".to_string())));
    }

    #[test]
    fn pe_rows_zip_by_occurrence() {
        let info = TypeInfo::new("Income")
            .field(
                "Income",
                "",
                FieldKind::GroupSeq(vec![
                    TypeField {
                        name: "Currency".to_string(),
                        tag: TagSpec::parse("::CR").unwrap(),
                        kind: FieldKind::Scalar {
                            format: FieldFormat::Alpha,
                            length: 3,
                        },
                    },
                    TypeField {
                        name: "Amount".to_string(),
                        tag: TagSpec::parse("::AM").unwrap(),
                        kind: FieldKind::Scalar {
                            format: FieldFormat::Packed,
                            length: 6,
                        },
                    },
                ]),
            )
            .unwrap();

        let mut record = Record::new(Isn(1));
        record.fields.push(RecordValue {
            name: "Currency".to_string(),
            short: "CR".parse().unwrap(),
            values: vec![
                FieldValue::Alpha("EUR".to_string()),
                FieldValue::Alpha("USD".to_string()),
            ],
        });
        record.fields.push(RecordValue {
            name: "Amount".to_string(),
            short: "AM".parse().unwrap(),
            values: vec![FieldValue::Packed(100), FieldValue::Packed(200)],
        });

        let value = info.record_to_value(&record).unwrap();
        let rows = value["Income"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["Currency"], "USD");
        assert_eq!(rows[1]["Amount"], 200);

        let back = info.value_to_record(&value).unwrap();
        assert_eq!(back.quantity("Currency"), 2);
        assert_eq!(back.quantity("Amount"), 2);
    }

    #[test]
    fn missing_short_name_rejected() {
        let err = TypeInfo::new("Broken")
            .field(
                "NoTag",
                "",
                FieldKind::Scalar {
                    format: FieldFormat::Alpha,
                    length: 4,
                },
            )
            .unwrap()
            .to_map("acj;target=24", Fnr(11))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnknownField { .. })
        ));
    }
}
