use adalink_core::error::ProtocolError;
use serde::{Deserialize, Serialize};

use crate::fdt::FieldFormat;

/// A typed scalar as it appears in a materialised record.
///
/// Packed and unpacked decimals are carried as integers; the byte length of
/// the wire form decides the digit count, there is no implied decimal point
/// at this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Alpha(String),
    Unicode(String),
    Int(i64),
    Uint(u64),
    Packed(i64),
    Unpacked(i64),
    Float(f64),
    Binary(Vec<u8>),
    /// Placeholder for a large object; carries the size only, the content
    /// is fetched through segment reads.
    Lob {
        size: u32,
    },
}

impl FieldValue {
    /// Encode into exactly `length` bytes of the given wire format.
    pub fn encode(&self, format: FieldFormat, length: u32) -> Result<Vec<u8>, ProtocolError> {
        let length = length as usize;
        match (self, format) {
            (FieldValue::Alpha(s), FieldFormat::Alpha)
            | (FieldValue::Unicode(s), FieldFormat::Unicode) => {
                let mut out = s.as_bytes().to_vec();
                if out.len() > length {
                    return Err(ProtocolError::InvalidValue {
                        field: "FieldValue",
                        reason: "string longer than field length",
                    });
                }
                out.resize(length, b' ');
                Ok(out)
            }
            (FieldValue::Int(v), FieldFormat::Fixed) => encode_int(*v, length),
            (FieldValue::Uint(v), FieldFormat::Fixed) => {
                let v = i64::try_from(*v).map_err(|_| ProtocolError::InvalidValue {
                    field: "FieldValue",
                    reason: "unsigned value exceeds fixed range",
                })?;
                encode_int(v, length)
            }
            (FieldValue::Packed(v), FieldFormat::Packed) => encode_packed(*v, length),
            (FieldValue::Int(v), FieldFormat::Packed) => encode_packed(*v, length),
            (FieldValue::Uint(v), FieldFormat::Packed) => {
                let v = i64::try_from(*v).map_err(|_| ProtocolError::InvalidValue {
                    field: "FieldValue",
                    reason: "unsigned value exceeds packed range",
                })?;
                encode_packed(v, length)
            }
            (FieldValue::Unpacked(v), FieldFormat::Unpacked)
            | (FieldValue::Int(v), FieldFormat::Unpacked) => encode_unpacked(*v, length),
            (FieldValue::Float(v), FieldFormat::Float) => match length {
                4 => Ok((*v as f32).to_le_bytes().to_vec()),
                8 => Ok(v.to_le_bytes().to_vec()),
                _ => Err(ProtocolError::InvalidValue {
                    field: "FieldValue",
                    reason: "float length must be 4 or 8",
                }),
            },
            (FieldValue::Binary(b), FieldFormat::Binary) => {
                let mut out = b.clone();
                if out.len() > length {
                    return Err(ProtocolError::InvalidValue {
                        field: "FieldValue",
                        reason: "binary longer than field length",
                    });
                }
                out.resize(length, 0);
                Ok(out)
            }
            (FieldValue::Alpha(s), FieldFormat::Binary) => {
                // Callers occasionally pass printable content for binary
                // fields, e.g. URL strings in map records.
                let mut out = s.as_bytes().to_vec();
                out.resize(length, 0);
                Ok(out)
            }
            _ => Err(ProtocolError::InvalidValue {
                field: "FieldValue",
                reason: "value kind does not match field format",
            }),
        }
    }

    /// Decode `length` bytes of the given wire format.
    pub fn decode(bytes: &[u8], format: FieldFormat, length: u32) -> Result<Self, ProtocolError> {
        let length = length as usize;
        if bytes.len() < length {
            return Err(ProtocolError::Truncated {
                at: bytes.len(),
                needed: length,
            });
        }
        let bytes = &bytes[..length];
        Ok(match format {
            FieldFormat::Alpha => {
                FieldValue::Alpha(String::from_utf8_lossy(bytes).trim_end().to_string())
            }
            FieldFormat::Unicode => {
                FieldValue::Unicode(String::from_utf8_lossy(bytes).trim_end().to_string())
            }
            FieldFormat::Fixed => FieldValue::Int(decode_int(bytes)?),
            FieldFormat::Packed => FieldValue::Packed(decode_packed(bytes)?),
            FieldFormat::Unpacked => FieldValue::Unpacked(decode_unpacked(bytes)?),
            FieldFormat::Float => match length {
                4 => {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(bytes);
                    FieldValue::Float(f32::from_le_bytes(b) as f64)
                }
                8 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(bytes);
                    FieldValue::Float(f64::from_le_bytes(b))
                }
                _ => {
                    return Err(ProtocolError::InvalidValue {
                        field: "FieldValue",
                        reason: "float length must be 4 or 8",
                    })
                }
            },
            FieldFormat::Binary => FieldValue::Binary(bytes.to_vec()),
        })
    }

    /// True when this is the zero value of its kind; used for MU trailing
    /// slot suppression.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Alpha(s) | FieldValue::Unicode(s) => s.is_empty(),
            FieldValue::Int(v) | FieldValue::Packed(v) | FieldValue::Unpacked(v) => *v == 0,
            FieldValue::Uint(v) => *v == 0,
            FieldValue::Float(v) => *v == 0.0,
            FieldValue::Binary(b) => b.iter().all(|x| *x == 0),
            FieldValue::Lob { size } => *size == 0,
        }
    }
}

fn encode_int(v: i64, length: usize) -> Result<Vec<u8>, ProtocolError> {
    let bytes = v.to_le_bytes();
    if length > 8 || length == 0 {
        return Err(ProtocolError::InvalidValue {
            field: "FieldValue",
            reason: "fixed length must be 1..=8",
        });
    }
    // Range check: the dropped high bytes must be pure sign extension.
    let fill = if v < 0 { 0xff } else { 0x00 };
    if bytes[length..].iter().any(|b| *b != fill) {
        return Err(ProtocolError::InvalidValue {
            field: "FieldValue",
            reason: "integer does not fit field length",
        });
    }
    Ok(bytes[..length].to_vec())
}

fn decode_int(bytes: &[u8]) -> Result<i64, ProtocolError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(ProtocolError::InvalidValue {
            field: "FieldValue",
            reason: "fixed length must be 1..=8",
        });
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    let mut full = [if negative { 0xff } else { 0x00 }; 8];
    full[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(full))
}

// Packed decimal: BCD digits left to right, sign in the low nibble of the
// last byte (0xC positive, 0xD negative).
fn encode_packed(v: i64, length: usize) -> Result<Vec<u8>, ProtocolError> {
    let digits = length * 2 - 1;
    let abs = v.unsigned_abs();
    let mut text = abs.to_string();
    if text.len() > digits {
        return Err(ProtocolError::InvalidValue {
            field: "FieldValue",
            reason: "packed value does not fit field length",
        });
    }
    while text.len() < digits {
        text.insert(0, '0');
    }
    let mut nibbles: Vec<u8> = text.bytes().map(|b| b - b'0').collect();
    nibbles.push(if v < 0 { 0xD } else { 0xC });
    let out = nibbles
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect();
    Ok(out)
}

fn decode_packed(bytes: &[u8]) -> Result<i64, ProtocolError> {
    if bytes.is_empty() {
        return Err(ProtocolError::InvalidValue {
            field: "FieldValue",
            reason: "empty packed value",
        });
    }
    let mut v: i64 = 0;
    let mut push = |nibble: u8, acc: &mut i64| -> Result<(), ProtocolError> {
        if nibble > 9 {
            return Err(ProtocolError::InvalidValue {
                field: "FieldValue",
                reason: "invalid packed digit",
            });
        }
        *acc = acc
            .checked_mul(10)
            .and_then(|x| x.checked_add(i64::from(nibble)))
            .ok_or(ProtocolError::InvalidValue {
                field: "FieldValue",
                reason: "packed value overflows",
            })?;
        Ok(())
    };
    let (body, last) = bytes.split_at(bytes.len() - 1);
    for b in body {
        push(b >> 4, &mut v)?;
        push(b & 0x0F, &mut v)?;
    }
    push(last[0] >> 4, &mut v)?;
    match last[0] & 0x0F {
        0xC | 0xF => Ok(v),
        0xD => Ok(-v),
        _ => Err(ProtocolError::InvalidValue {
            field: "FieldValue",
            reason: "invalid packed sign nibble",
        }),
    }
}

// Unpacked (zoned) decimal: ASCII digits; a negative value carries zone 0x7
// in the last byte.
fn encode_unpacked(v: i64, length: usize) -> Result<Vec<u8>, ProtocolError> {
    let abs = v.unsigned_abs();
    let mut text = abs.to_string();
    if text.len() > length {
        return Err(ProtocolError::InvalidValue {
            field: "FieldValue",
            reason: "unpacked value does not fit field length",
        });
    }
    while text.len() < length {
        text.insert(0, '0');
    }
    let mut out = text.into_bytes();
    if v < 0 {
        let last = out.len() - 1;
        out[last] = 0x70 | (out[last] & 0x0F);
    }
    Ok(out)
}

fn decode_unpacked(bytes: &[u8]) -> Result<i64, ProtocolError> {
    let mut v: i64 = 0;
    let mut negative = false;
    for (i, b) in bytes.iter().enumerate() {
        let digit = b & 0x0F;
        let zone = b >> 4;
        if digit > 9 {
            return Err(ProtocolError::InvalidValue {
                field: "FieldValue",
                reason: "invalid unpacked digit",
            });
        }
        if i == bytes.len() - 1 && zone == 0x7 {
            negative = true;
        }
        v = v
            .checked_mul(10)
            .and_then(|x| x.checked_add(i64::from(digit)))
            .ok_or(ProtocolError::InvalidValue {
                field: "FieldValue",
                reason: "unpacked value overflows",
            })?;
    }
    Ok(if negative { -v } else { v })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_pads_and_trims() {
        let v = FieldValue::Alpha("SMITH".to_string());
        let bytes = v.encode(FieldFormat::Alpha, 8).unwrap();
        assert_eq!(&bytes, b"SMITH   ");
        assert_eq!(FieldValue::decode(&bytes, FieldFormat::Alpha, 8).unwrap(), v);
    }

    #[test]
    fn alpha_overflow_rejected() {
        let v = FieldValue::Alpha("TOOLONGVALUE".to_string());
        assert!(v.encode(FieldFormat::Alpha, 4).is_err());
    }

    #[test]
    fn fixed_round_trip_with_sign() {
        for v in [-1i64, 0, 1, 127, -128, 30_000, -30_000] {
            let bytes = FieldValue::Int(v).encode(FieldFormat::Fixed, 2).unwrap();
            assert_eq!(bytes.len(), 2);
            assert_eq!(
                FieldValue::decode(&bytes, FieldFormat::Fixed, 2).unwrap(),
                FieldValue::Int(v)
            );
        }
        assert!(FieldValue::Int(70_000).encode(FieldFormat::Fixed, 2).is_err());
    }

    #[test]
    fn packed_round_trip() {
        for v in [0i64, 1, -1, 12345, -67890, 99_999_999_999] {
            let bytes = FieldValue::Packed(v).encode(FieldFormat::Packed, 6).unwrap();
            assert_eq!(bytes.len(), 6);
            assert_eq!(
                FieldValue::decode(&bytes, FieldFormat::Packed, 6).unwrap(),
                FieldValue::Packed(v)
            );
        }
    }

    #[test]
    fn packed_sign_nibbles() {
        let pos = FieldValue::Packed(5).encode(FieldFormat::Packed, 1).unwrap();
        assert_eq!(pos, vec![0x5C]);
        let neg = FieldValue::Packed(-5).encode(FieldFormat::Packed, 1).unwrap();
        assert_eq!(neg, vec![0x5D]);
    }

    #[test]
    fn unpacked_round_trip() {
        for v in [0i64, 7, -7, 1234, -9876] {
            let bytes = FieldValue::Unpacked(v)
                .encode(FieldFormat::Unpacked, 6)
                .unwrap();
            assert_eq!(bytes.len(), 6);
            assert_eq!(
                FieldValue::decode(&bytes, FieldFormat::Unpacked, 6).unwrap(),
                FieldValue::Unpacked(v)
            );
        }
    }

    #[test]
    fn float_both_widths() {
        let v = FieldValue::Float(2.5);
        let b4 = v.encode(FieldFormat::Float, 4).unwrap();
        assert_eq!(FieldValue::decode(&b4, FieldFormat::Float, 4).unwrap(), v);
        let b8 = v.encode(FieldFormat::Float, 8).unwrap();
        assert_eq!(FieldValue::decode(&b8, FieldFormat::Float, 8).unwrap(), v);
    }

    #[test]
    fn truncated_decode_reports_need() {
        let err = FieldValue::decode(&[0u8; 2], FieldFormat::Alpha, 8).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { at: 2, needed: 8 });
    }
}
