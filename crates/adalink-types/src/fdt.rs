use std::fmt;
use std::str::FromStr;

use adalink_core::error::{ConfigError, ProtocolError};
use adalink_core::types::Fnr;
use serde::{Deserialize, Serialize};

/// Two-letter Adabas field name. Stored uppercased; comparison is therefore
/// case-insensitive as the short-name grammar requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortName([u8; 2]);

impl ShortName {
    pub fn new(bytes: [u8; 2]) -> Self {
        ShortName([bytes[0].to_ascii_uppercase(), bytes[1].to_ascii_uppercase()])
    }

    pub fn bytes(self) -> [u8; 2] {
        self.0
    }

    pub fn as_str(&self) -> &str {
        // ASCII by construction.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl FromStr for ShortName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = s.as_bytes();
        if b.len() != 2 || !b.iter().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::UnknownField {
                name: s.to_string(),
            });
        }
        Ok(ShortName::new([b[0], b[1]]))
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Adabas field format, identified on the wire by one character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldFormat {
    Alpha,
    Unicode,
    Binary,
    Fixed,
    Packed,
    Unpacked,
    Float,
}

impl FieldFormat {
    pub fn code(self) -> char {
        match self {
            FieldFormat::Alpha => 'A',
            FieldFormat::Unicode => 'W',
            FieldFormat::Binary => 'B',
            FieldFormat::Fixed => 'F',
            FieldFormat::Packed => 'P',
            FieldFormat::Unpacked => 'U',
            FieldFormat::Float => 'G',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c.to_ascii_uppercase() {
            'A' => FieldFormat::Alpha,
            'W' => FieldFormat::Unicode,
            'B' => FieldFormat::Binary,
            'F' => FieldFormat::Fixed,
            'P' => FieldFormat::Packed,
            'U' => FieldFormat::Unpacked,
            'G' => FieldFormat::Float,
            _ => return None,
        })
    }
}

/// Per-field option flags of an FDT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldFlags(pub u16);

impl FieldFlags {
    pub const DESCRIPTOR: u16 = 0x0001;
    pub const MU: u16 = 0x0002;
    pub const PE: u16 = 0x0004;
    pub const NULL_SUPPRESSED: u16 = 0x0008;
    pub const LOB: u16 = 0x0010;
    pub const SYSTEM: u16 = 0x0020;

    pub fn has(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn is_descriptor(self) -> bool {
        self.has(Self::DESCRIPTOR)
    }

    pub fn is_mu(self) -> bool {
        self.has(Self::MU)
    }

    pub fn is_pe(self) -> bool {
        self.has(Self::PE)
    }

    /// MU or PE membership, i.e. the field repeats.
    pub fn is_periodic(self) -> bool {
        self.has(Self::MU) || self.has(Self::PE)
    }
}

/// One entry of a field definition table. Group entries carry children;
/// length 0 marks a dynamic (LOB or variable) field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FdtField {
    pub level: u8,
    pub name: ShortName,
    pub length: u32,
    pub format: FieldFormat,
    pub flags: FieldFlags,
    pub children: Vec<FdtField>,
}

impl FdtField {
    pub fn is_group(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn is_dynamic(&self) -> bool {
        self.length == 0
    }
}

/// Field definition table of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fdt {
    pub fnr: Fnr,
    pub fields: Vec<FdtField>,
}

/// Size of one serialised FDT entry in the LF record buffer:
/// level u8, short name 2 bytes, format u8, flags u16, length u32.
pub const FDT_ENTRY_LEN: usize = 10;

impl Fdt {
    /// Build a tree from a flat level-ordered entry list. A level-n entry
    /// becomes a child of the most recent level-(n-1) entry; MU/PE flags of
    /// a parent apply to the whole subtree. Sibling short names must be
    /// unique.
    pub fn from_entries(fnr: Fnr, entries: Vec<FdtField>) -> Result<Self, ProtocolError> {
        let mut roots: Vec<FdtField> = Vec::new();
        for entry in entries {
            if entry.level <= 1 {
                roots.push(entry);
            } else {
                let parent = last_at_level(&mut roots, entry.level - 1).ok_or(
                    ProtocolError::InvalidValue {
                        field: "FdtField.level",
                        reason: "entry level has no preceding parent level",
                    },
                )?;
                let mut entry = entry;
                // Repeating-group membership propagates downwards.
                if parent.flags.is_mu() {
                    entry.flags.set(FieldFlags::MU);
                }
                if parent.flags.is_pe() {
                    entry.flags.set(FieldFlags::PE);
                }
                parent.children.push(entry);
            }
        }
        check_sibling_names(&roots)?;
        Ok(Fdt { fnr, fields: roots })
    }

    /// Look a field up by short name anywhere in the tree.
    pub fn field(&self, name: ShortName) -> Option<&FdtField> {
        fn walk<'a>(fields: &'a [FdtField], name: ShortName) -> Option<&'a FdtField> {
            for f in fields {
                if f.name == name {
                    return Some(f);
                }
                if let Some(hit) = walk(&f.children, name) {
                    return Some(hit);
                }
            }
            None
        }
        walk(&self.fields, name)
    }

    pub fn contains(&self, name: ShortName) -> bool {
        self.field(name).is_some()
    }

    /// All leaf fields in definition order.
    pub fn leaves(&self) -> Vec<&FdtField> {
        fn walk<'a>(fields: &'a [FdtField], out: &mut Vec<&'a FdtField>) {
            for f in fields {
                if f.is_group() {
                    walk(&f.children, out);
                } else {
                    out.push(f);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.fields, &mut out);
        out
    }

    /// Top-level fields, used by the `*` query expansion.
    pub fn top_level(&self) -> &[FdtField] {
        &self.fields
    }

    /// Parse the binary dump returned by an LF call with option 'X'.
    /// Trailing bytes after the last full entry are tolerated.
    pub fn from_lf_bytes(fnr: Fnr, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut entries = Vec::new();
        let mut off = 0;
        while off + FDT_ENTRY_LEN <= bytes.len() {
            let level = bytes[off];
            if level == 0 {
                // Zero level terminates the dump; the record buffer is
                // usually larger than the definition it carries.
                break;
            }
            let name = ShortName::new([bytes[off + 1], bytes[off + 2]]);
            let format = FieldFormat::from_code(bytes[off + 3] as char).ok_or(
                ProtocolError::InvalidValue {
                    field: "FdtField.format",
                    reason: "unknown format code",
                },
            )?;
            let flags = FieldFlags(u16::from_le_bytes([bytes[off + 4], bytes[off + 5]]));
            let length = u32::from_le_bytes([
                bytes[off + 6],
                bytes[off + 7],
                bytes[off + 8],
                bytes[off + 9],
            ]);
            entries.push(FdtField {
                level,
                name,
                length,
                format,
                flags,
                children: Vec::new(),
            });
            off += FDT_ENTRY_LEN;
        }
        log::trace!("lf dump for file {fnr} carries {} entries", entries.len());
        Fdt::from_entries(fnr, entries)
    }

    /// Serialise to the LF dump layout. Counterpart of `from_lf_bytes`,
    /// used by test servers.
    pub fn to_lf_bytes(&self) -> Vec<u8> {
        fn walk(fields: &[FdtField], out: &mut Vec<u8>) {
            for f in fields {
                out.push(f.level);
                out.extend_from_slice(&f.name.bytes());
                out.push(f.format.code() as u8);
                out.extend_from_slice(&f.flags.0.to_le_bytes());
                out.extend_from_slice(&f.length.to_le_bytes());
                walk(&f.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.fields, &mut out);
        out
    }
}

fn last_at_level(roots: &mut [FdtField], level: u8) -> Option<&mut FdtField> {
    let last = roots.last_mut()?;
    if last.level == level {
        return Some(last);
    }
    last_at_level(&mut last.children, level)
}

fn check_sibling_names(fields: &[FdtField]) -> Result<(), ProtocolError> {
    for (i, f) in fields.iter().enumerate() {
        if fields[..i].iter().any(|g| g.name == f.name) {
            return Err(ProtocolError::InvalidValue {
                field: "FdtField.name",
                reason: "duplicate short name among siblings",
            });
        }
        check_sibling_names(&f.children)?;
    }
    Ok(())
}

/// Convenience constructor for flat scalar entries, mostly used in tests
/// and by the dynamic-map builder.
pub fn scalar(name: &str, length: u32, format: FieldFormat, flags: u16) -> FdtField {
    FdtField {
        level: 1,
        name: name.parse().unwrap_or(ShortName::new(*b"??")),
        length,
        format,
        flags: FieldFlags(flags),
        children: Vec::new(),
    }
}
