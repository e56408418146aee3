use adalink_core::error::{ConfigError, ProtocolError};

use crate::fdt::{FieldFormat, ShortName};
use crate::value::FieldValue;

/// Occurrence window compiled for a repeating field when the query does not
/// name an explicit range.
pub const DEFAULT_OCCURRENCES: u32 = 10;

/// One element of a parsed field query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryField {
    pub name: String,
    /// `name[N]` marks the field null-suppressed for this query.
    pub null_suppressed: bool,
    /// `name[i-j]` selects an explicit MU/PE occurrence range.
    pub range: Option<(u32, u32)>,
}

/// A parsed comma-separated field query. `*` expands to all top-level
/// fields at resolution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldQuery {
    pub fields: Vec<QueryField>,
    pub all: bool,
}

impl FieldQuery {
    /// Parse the query grammar: `name` | `name[N]` | `name[i-j]` | `*`,
    /// comma-separated.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut fields = Vec::new();
        let mut all = false;
        for raw in spec.split(',') {
            let element = raw.trim();
            if element.is_empty() {
                return Err(ConfigError::InvalidQueryElement {
                    element: raw.to_string(),
                });
            }
            if element == "*" {
                all = true;
                continue;
            }
            let (name, bracket) = match element.find('[') {
                Some(open) => {
                    if !element.ends_with(']') {
                        return Err(ConfigError::InvalidQueryElement {
                            element: element.to_string(),
                        });
                    }
                    (
                        &element[..open],
                        Some(&element[open + 1..element.len() - 1]),
                    )
                }
                None => (element, None),
            };
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ConfigError::InvalidQueryElement {
                    element: element.to_string(),
                });
            }
            let mut field = QueryField {
                name: name.to_string(),
                null_suppressed: false,
                range: None,
            };
            if let Some(spec) = bracket {
                if spec.eq_ignore_ascii_case("N") {
                    field.null_suppressed = true;
                } else if let Some((from, to)) = spec.split_once('-') {
                    let from: u32 = from.trim().parse().map_err(|_| {
                        ConfigError::InvalidQueryElement {
                            element: element.to_string(),
                        }
                    })?;
                    let to: u32 = to.trim().parse().map_err(|_| {
                        ConfigError::InvalidQueryElement {
                            element: element.to_string(),
                        }
                    })?;
                    if from == 0 || to < from {
                        return Err(ConfigError::InvalidQueryElement {
                            element: element.to_string(),
                        });
                    }
                    field.range = Some((from, to));
                } else {
                    let index: u32 = spec.trim().parse().map_err(|_| {
                        ConfigError::InvalidQueryElement {
                            element: element.to_string(),
                        }
                    })?;
                    if index == 0 {
                        return Err(ConfigError::InvalidQueryElement {
                            element: element.to_string(),
                        });
                    }
                    field.range = Some((index, index));
                }
            }
            fields.push(field);
        }
        if fields.is_empty() && !all {
            return Err(ConfigError::InvalidQueryElement {
                element: spec.to_string(),
            });
        }
        Ok(FieldQuery { fields, all })
    }
}

/// A query element after name resolution against the FDT (and map, when
/// present).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedField {
    /// Name the caller used; long name on map-backed requests.
    pub query_name: String,
    pub short: ShortName,
    pub format: FieldFormat,
    pub length: u32,
    pub repeats: bool,
    pub null_suppressed: bool,
    /// Large-object field: only its four-byte size word travels inline.
    pub lob: bool,
    pub range: Option<(u32, u32)>,
}

/// Position of one selected field within the record buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    pub short: ShortName,
    pub format: FieldFormat,
    pub length: u32,
    pub offset: usize,
    pub kind: SlotKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Plain,
    /// A repeating field: a four-byte occurrence count precedes `window`
    /// fixed-width value slots starting at occurrence `first`.
    Repeating {
        count_offset: usize,
        first: u32,
        window: u32,
    },
    /// A large-object field: four bytes holding the object size, the
    /// content stays on the server.
    Lob,
}

/// The compiled form of a field query: format buffer text, record layout
/// and total record length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
    pub text: String,
    pub slots: Vec<Slot>,
    pub record_len: usize,
}

/// Size of the occurrence-count entry preceding a repeating field.
pub const COUNT_LEN: usize = 4;

impl FormatSpec {
    /// Compile resolved fields into format buffer text and record layout.
    ///
    /// Plain fields emit `name,length,format`; repeating fields emit a
    /// C-count entry first (`xxC,4,B`) so the server reports the number of
    /// occurrences, then the occurrence window `xxI-J,length,format`. A
    /// null-suppressed field appends `N` to its format code; large objects
    /// select only their size word.
    pub fn compile(resolved: &[ResolvedField]) -> FormatSpec {
        let mut text = String::new();
        let mut slots = Vec::with_capacity(resolved.len());
        let mut offset = 0usize;
        for field in resolved {
            if !text.is_empty() {
                text.push(',');
            }
            let suffix = if field.null_suppressed { "N" } else { "" };
            if field.lob {
                text.push_str(&format!("{},4,B", field.short));
                slots.push(Slot {
                    name: field.query_name.clone(),
                    short: field.short,
                    format: field.format,
                    length: 4,
                    offset,
                    kind: SlotKind::Lob,
                });
                offset += 4;
            } else if field.repeats {
                let (first, last) = field
                    .range
                    .unwrap_or((1, DEFAULT_OCCURRENCES));
                let window = last - first + 1;
                text.push_str(&format!(
                    "{sn}C,4,B,{sn}{first}-{last},{len},{fmt}{suffix}",
                    sn = field.short,
                    first = first,
                    last = last,
                    len = field.length,
                    fmt = field.format.code()
                ));
                slots.push(Slot {
                    name: field.query_name.clone(),
                    short: field.short,
                    format: field.format,
                    length: field.length,
                    offset: offset + COUNT_LEN,
                    kind: SlotKind::Repeating {
                        count_offset: offset,
                        first,
                        window,
                    },
                });
                offset += COUNT_LEN + (window as usize) * (field.length as usize);
            } else {
                text.push_str(&format!(
                    "{},{},{}{}",
                    field.short,
                    field.length,
                    field.format.code(),
                    suffix
                ));
                slots.push(Slot {
                    name: field.query_name.clone(),
                    short: field.short,
                    format: field.format,
                    length: field.length,
                    offset,
                    kind: SlotKind::Plain,
                });
                offset += field.length as usize;
            }
        }
        text.push('.');
        log::trace!("compiled format buffer {text} ({offset} bytes per record)");
        FormatSpec {
            text,
            slots,
            record_len: offset,
        }
    }

    /// Decode one record image into (name, values) pairs following the
    /// compiled layout. Repeating slots yield as many values as the
    /// occurrence count reports, capped at the compiled window.
    pub fn decode_record(
        &self,
        record: &[u8],
    ) -> Result<Vec<(String, Vec<FieldValue>)>, ProtocolError> {
        if record.len() < self.record_len {
            return Err(ProtocolError::Truncated {
                at: record.len(),
                needed: self.record_len,
            });
        }
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            match slot.kind {
                SlotKind::Plain => {
                    let bytes = &record[slot.offset..];
                    let value = FieldValue::decode(bytes, slot.format, slot.length)?;
                    out.push((slot.name.clone(), vec![value]));
                }
                SlotKind::Repeating {
                    count_offset,
                    window,
                    ..
                } => {
                    let count = u32::from_le_bytes([
                        record[count_offset],
                        record[count_offset + 1],
                        record[count_offset + 2],
                        record[count_offset + 3],
                    ]);
                    let used = count.min(window);
                    let mut values = Vec::with_capacity(used as usize);
                    for occ in 0..used {
                        let at = slot.offset + (occ as usize) * (slot.length as usize);
                        values.push(FieldValue::decode(&record[at..], slot.format, slot.length)?);
                    }
                    out.push((slot.name.clone(), values));
                }
                SlotKind::Lob => {
                    let at = slot.offset;
                    let size = u32::from_le_bytes([
                        record[at],
                        record[at + 1],
                        record[at + 2],
                        record[at + 3],
                    ]);
                    out.push((slot.name.clone(), vec![FieldValue::Lob { size }]));
                }
            }
        }
        Ok(out)
    }

    /// Encode values into a record image following the compiled layout.
    /// Missing fields stay zeroed; repeating fields write their occurrence
    /// count.
    pub fn encode_record(
        &self,
        values: &[(String, Vec<FieldValue>)],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut record = vec![0u8; self.record_len];
        for slot in &self.slots {
            let Some((_, field_values)) = values.iter().find(|(n, _)| *n == slot.name) else {
                continue;
            };
            match slot.kind {
                SlotKind::Plain => {
                    let Some(value) = field_values.first() else {
                        continue;
                    };
                    let bytes = value.encode(slot.format, slot.length)?;
                    record[slot.offset..slot.offset + bytes.len()].copy_from_slice(&bytes);
                }
                SlotKind::Repeating {
                    count_offset,
                    window,
                    ..
                } => {
                    if field_values.len() > window as usize {
                        return Err(ProtocolError::InvalidValue {
                            field: "FormatSpec",
                            reason: "more occurrences than the compiled window",
                        });
                    }
                    let count = field_values.len() as u32;
                    record[count_offset..count_offset + 4].copy_from_slice(&count.to_le_bytes());
                    for (occ, value) in field_values.iter().enumerate() {
                        let at = slot.offset + occ * (slot.length as usize);
                        let bytes = value.encode(slot.format, slot.length)?;
                        record[at..at + bytes.len()].copy_from_slice(&bytes);
                    }
                }
                SlotKind::Lob => {
                    let size = match field_values.first() {
                        Some(FieldValue::Lob { size }) => *size,
                        _ => 0,
                    };
                    record[slot.offset..slot.offset + 4].copy_from_slice(&size.to_le_bytes());
                }
            }
        }
        Ok(record)
    }

    /// Parse format buffer text back into a field query, undoing the sugar
    /// expansion (C-count entries fold back into their range entry).
    pub fn text_to_query(text: &str) -> Result<FieldQuery, ProtocolError> {
        let trimmed = text.strip_suffix('.').ok_or(ProtocolError::InvalidValue {
            field: "FormatSpec.text",
            reason: "format buffer must end with '.'",
        })?;
        let parts: Vec<&str> = trimmed.split(',').collect();
        if parts.len() % 3 != 0 {
            return Err(ProtocolError::InvalidValue {
                field: "FormatSpec.text",
                reason: "format buffer elements must be name,length,format triples",
            });
        }
        let mut fields = Vec::new();
        let mut pending_count: Option<String> = None;
        for triple in parts.chunks(3) {
            let name = triple[0];
            // A trailing N on the format code marks null suppression.
            let null_suppressed = triple[2].len() > 1 && triple[2].ends_with('N');
            if name.len() < 2 {
                return Err(ProtocolError::InvalidValue {
                    field: "FormatSpec.text",
                    reason: "field reference shorter than two characters",
                });
            }
            if name.len() == 3 && name.ends_with('C') {
                pending_count = Some(name[..2].to_string());
                continue;
            }
            if let Some(range_at) = name[2..].find(|c: char| c.is_ascii_digit()) {
                // Occurrence range entry like AS1-10.
                let base = &name[..2 + range_at];
                let range = &name[2 + range_at..];
                let (from, to) = range.split_once('-').ok_or(ProtocolError::InvalidValue {
                    field: "FormatSpec.text",
                    reason: "repeating entry without occurrence range",
                })?;
                let from: u32 = from.parse().map_err(|_| ProtocolError::InvalidValue {
                    field: "FormatSpec.text",
                    reason: "bad occurrence range start",
                })?;
                let to: u32 = to.parse().map_err(|_| ProtocolError::InvalidValue {
                    field: "FormatSpec.text",
                    reason: "bad occurrence range end",
                })?;
                if pending_count.take().as_deref() != Some(base) {
                    return Err(ProtocolError::InvalidValue {
                        field: "FormatSpec.text",
                        reason: "occurrence range without preceding count entry",
                    });
                }
                fields.push(QueryField {
                    name: base.to_string(),
                    null_suppressed,
                    range: Some((from, to)),
                });
            } else {
                fields.push(QueryField {
                    name: name.to_string(),
                    null_suppressed,
                    range: None,
                });
            }
        }
        Ok(FieldQuery { fields, all: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(name: &str, len: u32, format: FieldFormat, repeats: bool) -> ResolvedField {
        ResolvedField {
            query_name: name.to_string(),
            short: name.parse().unwrap(),
            format,
            length: len,
            repeats,
            null_suppressed: false,
            lob: false,
            range: None,
        }
    }

    #[test]
    fn parses_plain_elements() {
        let q = FieldQuery::parse("AA,AB,AS[N]").unwrap();
        assert_eq!(q.fields.len(), 3);
        assert!(q.fields[2].null_suppressed);
        assert!(!q.all);
    }

    #[test]
    fn parses_ranges_and_star() {
        let q = FieldQuery::parse("AS[1-4],*").unwrap();
        assert_eq!(q.fields[0].range, Some((1, 4)));
        assert!(q.all);
        let q = FieldQuery::parse("AS[3]").unwrap();
        assert_eq!(q.fields[0].range, Some((3, 3)));
    }

    #[test]
    fn rejects_bad_elements() {
        assert!(FieldQuery::parse("").is_err());
        assert!(FieldQuery::parse("AA,").is_err());
        assert!(FieldQuery::parse("AS[4-2]").is_err());
        assert!(FieldQuery::parse("AS[0]").is_err());
        assert!(FieldQuery::parse("A S").is_err());
    }

    #[test]
    fn compiles_plain_and_repeating() {
        let spec = FormatSpec::compile(&[
            resolved("AA", 8, FieldFormat::Alpha, false),
            resolved("AS", 6, FieldFormat::Packed, true),
        ]);
        assert_eq!(spec.text, "AA,8,A,ASC,4,B,AS1-10,6,P.");
        assert_eq!(spec.record_len, 8 + 4 + 10 * 6);
        assert_eq!(spec.slots.len(), 2);
        match spec.slots[1].kind {
            SlotKind::Repeating {
                count_offset,
                first,
                window,
            } => {
                assert_eq!(count_offset, 8);
                assert_eq!(first, 1);
                assert_eq!(window, 10);
            }
            _ => panic!("expected repeating slot"),
        }
    }

    #[test]
    fn record_round_trip_with_occurrences() {
        let spec = FormatSpec::compile(&[
            resolved("AA", 8, FieldFormat::Alpha, false),
            resolved("AS", 6, FieldFormat::Packed, true),
        ]);
        let values = vec![
            (
                "AA".to_string(),
                vec![FieldValue::Alpha("50005500".to_string())],
            ),
            (
                "AS".to_string(),
                vec![FieldValue::Packed(12345), FieldValue::Packed(67890)],
            ),
        ];
        let record = spec.encode_record(&values).unwrap();
        assert_eq!(record.len(), spec.record_len);
        let decoded = spec.decode_record(&record).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn null_suppression_marks_the_compiled_entry() {
        let mut plain = resolved("AA", 8, FieldFormat::Alpha, false);
        let spec_plain = FormatSpec::compile(&[plain.clone()]);
        plain.null_suppressed = true;
        let spec_n = FormatSpec::compile(&[plain]);
        assert_eq!(spec_plain.text, "AA,8,A.");
        assert_eq!(spec_n.text, "AA,8,AN.");
        assert_eq!(spec_plain.record_len, spec_n.record_len);

        let mut repeating = resolved("AS", 6, FieldFormat::Packed, true);
        repeating.null_suppressed = true;
        let spec = FormatSpec::compile(&[repeating]);
        assert_eq!(spec.text, "ASC,4,B,AS1-10,6,PN.");

        let query = FormatSpec::text_to_query(&spec.text).unwrap();
        assert!(query.fields[0].null_suppressed);
        let query = FormatSpec::text_to_query("AA,8,A.").unwrap();
        assert!(!query.fields[0].null_suppressed);
    }

    #[test]
    fn lob_fields_carry_their_size_word_only() {
        let mut lob = resolved("AL", 0, FieldFormat::Alpha, false);
        lob.lob = true;
        let spec = FormatSpec::compile(&[resolved("AA", 8, FieldFormat::Alpha, false), lob]);
        assert_eq!(spec.text, "AA,8,A,AL,4,B.");
        assert_eq!(spec.record_len, 12);

        let mut image = vec![0u8; spec.record_len];
        image[..8].copy_from_slice(b"50005500");
        image[8..12].copy_from_slice(&70000u32.to_le_bytes());
        let decoded = spec.decode_record(&image).unwrap();
        assert_eq!(decoded[1].1, vec![FieldValue::Lob { size: 70000 }]);

        let encoded = spec.encode_record(&decoded).unwrap();
        assert_eq!(encoded, image);
    }

    #[test]
    fn format_text_decodes_back_to_query() {
        let spec = FormatSpec::compile(&[
            resolved("AA", 8, FieldFormat::Alpha, false),
            resolved("AS", 6, FieldFormat::Packed, true),
        ]);
        let query = FormatSpec::text_to_query(&spec.text).unwrap();
        assert_eq!(query.fields.len(), 2);
        assert_eq!(query.fields[0].name, "AA");
        assert_eq!(query.fields[1].name, "AS");
        assert_eq!(query.fields[1].range, Some((1, DEFAULT_OCCURRENCES)));
    }
}
