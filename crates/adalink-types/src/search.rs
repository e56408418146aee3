use adalink_core::error::{ConfigError, ProtocolError};

use crate::fdt::{FieldFormat, ShortName};
use crate::value::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl SearchOp {
    /// Adabas spelling of the comparator in a search buffer.
    pub fn adabas(self) -> &'static str {
        match self {
            SearchOp::Eq => "EQ",
            SearchOp::Ne => "NE",
            SearchOp::Lt => "LT",
            SearchOp::Le => "LE",
            SearchOp::Gt => "GT",
            SearchOp::Ge => "GE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchLiteral {
    Text(String),
    Number(i64),
    /// Inclusive range `a..b`.
    Range(Box<SearchLiteral>, Box<SearchLiteral>),
    /// Trailing-`*` prefix match; compiled into an inclusive range over the
    /// full field width.
    Wildcard(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchTerm {
    pub field: String,
    /// MU/PE occurrence selector `name[i]`.
    pub index: Option<u32>,
    pub op: SearchOp,
    pub value: SearchLiteral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}

impl Connective {
    /// Adabas search buffer connective: `,D,` links with AND, `,R,` with OR.
    fn adabas(self) -> &'static str {
        match self {
            Connective::And => ",D,",
            Connective::Or => ",R,",
        }
    }
}

/// A parsed search expression: comparison terms joined left to right by
/// AND/OR connectives. `terms.len() == connectives.len() + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTree {
    pub terms: Vec<SearchTerm>,
    pub connectives: Vec<Connective>,
}

impl SearchTree {
    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let chunks = split_connectives(expr)?;
        let mut terms = Vec::new();
        let mut connectives = Vec::new();
        for (term_text, connective) in chunks {
            terms.push(parse_term(&term_text)?);
            if let Some(c) = connective {
                connectives.push(c);
            }
        }
        if terms.is_empty() {
            return Err(ConfigError::InvalidSearch {
                reason: "empty search expression".to_string(),
            });
        }
        if connectives.len() + 1 != terms.len() {
            return Err(ConfigError::InvalidSearch {
                reason: "dangling connective".to_string(),
            });
        }
        Ok(SearchTree { terms, connectives })
    }

    /// Emit the Adabas-syntax search buffer and the paired binary value
    /// buffer. `resolve` maps a field reference to its wire description.
    pub fn buffers<F>(&self, mut resolve: F) -> Result<(String, Vec<u8>), ConfigError>
    where
        F: FnMut(&str) -> Option<(ShortName, FieldFormat, u32)>,
    {
        let mut search = String::new();
        let mut values = Vec::new();
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                search.push_str(self.connectives[i - 1].adabas());
            }
            let (short, format, length) =
                resolve(&term.field).ok_or_else(|| ConfigError::UnknownField {
                    name: term.field.clone(),
                })?;
            let reference = match term.index {
                Some(idx) => format!("{}{}", short, idx),
                None => short.to_string(),
            };
            let descriptor = format!("{},{},{}", reference, length, format.code());
            match &term.value {
                SearchLiteral::Range(from, to) => {
                    // Range: from-value S to-value, both in the value buffer.
                    search.push_str(&descriptor);
                    search.push_str(",S,");
                    search.push_str(&descriptor);
                    values.extend(encode_literal(from, format, length)?);
                    values.extend(encode_literal(to, format, length)?);
                }
                SearchLiteral::Wildcard(prefix) => {
                    search.push_str(&descriptor);
                    search.push_str(",S,");
                    search.push_str(&descriptor);
                    values.extend(wildcard_bound(prefix, length, 0x00)?);
                    values.extend(wildcard_bound(prefix, length, 0xff)?);
                }
                literal => {
                    search.push_str(&descriptor);
                    search.push(',');
                    search.push_str(term.op.adabas());
                    values.extend(encode_literal(literal, format, length)?);
                }
            }
        }
        search.push('.');
        log::trace!(
            "compiled search buffer {search} with {} value bytes",
            values.len()
        );
        Ok((search, values))
    }

    /// Field references used by the expression, for descriptor checks.
    pub fn fields(&self) -> Vec<&str> {
        self.terms.iter().map(|t| t.field.as_str()).collect()
    }
}

fn encode_literal(
    literal: &SearchLiteral,
    format: FieldFormat,
    length: u32,
) -> Result<Vec<u8>, ConfigError> {
    let value = match (literal, format) {
        (SearchLiteral::Text(s), FieldFormat::Alpha) => FieldValue::Alpha(s.clone()),
        (SearchLiteral::Text(s), FieldFormat::Unicode) => FieldValue::Unicode(s.clone()),
        (SearchLiteral::Text(s), FieldFormat::Binary) => {
            FieldValue::Binary(s.as_bytes().to_vec())
        }
        (SearchLiteral::Number(v), FieldFormat::Fixed) => FieldValue::Int(*v),
        (SearchLiteral::Number(v), FieldFormat::Packed) => FieldValue::Packed(*v),
        (SearchLiteral::Number(v), FieldFormat::Unpacked) => FieldValue::Unpacked(*v),
        (SearchLiteral::Number(v), FieldFormat::Float) => FieldValue::Float(*v as f64),
        (SearchLiteral::Number(v), FieldFormat::Alpha) => FieldValue::Alpha(v.to_string()),
        _ => {
            return Err(ConfigError::InvalidSearch {
                reason: "literal kind does not match field format".to_string(),
            })
        }
    };
    value
        .encode(format, length)
        .map_err(|e: ProtocolError| ConfigError::InvalidSearch {
            reason: e.to_string(),
        })
}

fn wildcard_bound(prefix: &str, length: u32, fill: u8) -> Result<Vec<u8>, ConfigError> {
    let mut out = prefix.as_bytes().to_vec();
    if out.len() > length as usize {
        return Err(ConfigError::InvalidSearch {
            reason: "wildcard prefix longer than field".to_string(),
        });
    }
    out.resize(length as usize, fill);
    Ok(out)
}

/// Split on top-level AND/OR, respecting single-quoted strings. Returns the
/// term texts with the connective that follows each (None for the last).
fn split_connectives(expr: &str) -> Result<Vec<(String, Option<Connective>)>, ConfigError> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let bytes: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == '\'' {
            in_quote = !in_quote;
            current.push(c);
            i += 1;
            continue;
        }
        if !in_quote {
            if let Some(len) = keyword_at(&bytes, i, "AND") {
                out.push((current.trim().to_string(), Some(Connective::And)));
                current = String::new();
                i += len;
                continue;
            }
            if let Some(len) = keyword_at(&bytes, i, "OR") {
                out.push((current.trim().to_string(), Some(Connective::Or)));
                current = String::new();
                i += len;
                continue;
            }
        }
        current.push(c);
        i += 1;
    }
    if in_quote {
        return Err(ConfigError::InvalidSearch {
            reason: "unterminated quote".to_string(),
        });
    }
    let last = current.trim().to_string();
    if last.is_empty() && !out.is_empty() {
        return Err(ConfigError::InvalidSearch {
            reason: "dangling connective".to_string(),
        });
    }
    out.push((last, None));
    Ok(out)
}

/// Match a connective keyword surrounded by whitespace, case-insensitive.
fn keyword_at(chars: &[char], at: usize, keyword: &str) -> Option<usize> {
    if at == 0 || !chars[at - 1].is_whitespace() {
        return None;
    }
    let k: Vec<char> = keyword.chars().collect();
    if at + k.len() > chars.len() {
        return None;
    }
    for (i, kc) in k.iter().enumerate() {
        if !chars[at + i].eq_ignore_ascii_case(kc) {
            return None;
        }
    }
    match chars.get(at + k.len()) {
        Some(c) if c.is_whitespace() => Some(k.len() + 1),
        _ => None,
    }
}

fn parse_term(text: &str) -> Result<SearchTerm, ConfigError> {
    // Longest operators first so `<=` never parses as `<`.
    const OPS: [(&str, SearchOp); 10] = [
        ("<=", SearchOp::Le),
        (">=", SearchOp::Ge),
        ("!=", SearchOp::Ne),
        ("<>", SearchOp::Ne),
        ("=", SearchOp::Eq),
        ("<", SearchOp::Lt),
        (">", SearchOp::Gt),
        ("≠", SearchOp::Ne),
        ("≤", SearchOp::Le),
        ("≥", SearchOp::Ge),
    ];
    let invalid = || ConfigError::InvalidSearch {
        reason: format!("cannot parse term: {text}"),
    };
    let (op_at, op_text, op) = OPS
        .iter()
        .filter_map(|(s, op)| find_outside_quotes(text, s).map(|at| (at, *s, *op)))
        .min_by_key(|(at, s, _)| (*at, std::cmp::Reverse(s.len())))
        .ok_or_else(invalid)?;
    let field_part = text[..op_at].trim();
    let value_part = text[op_at + op_text.len()..].trim();
    if field_part.is_empty() || value_part.is_empty() {
        return Err(invalid());
    }

    let (field, index) = match field_part.find('[') {
        Some(open) => {
            let close = field_part.rfind(']').ok_or_else(invalid)?;
            let idx: u32 = field_part[open + 1..close]
                .trim()
                .parse()
                .map_err(|_| invalid())?;
            (field_part[..open].trim().to_string(), Some(idx))
        }
        None => (field_part.to_string(), None),
    };

    let value = parse_literal(value_part)?;
    Ok(SearchTerm {
        field,
        index,
        op,
        value,
    })
}

fn find_outside_quotes(text: &str, needle: &str) -> Option<usize> {
    let mut in_quote = false;
    let bytes = text.as_bytes();
    let nb = needle.as_bytes();
    let mut i = 0;
    while i + nb.len() <= bytes.len() {
        if bytes[i] == b'\'' {
            in_quote = !in_quote;
        } else if !in_quote && &bytes[i..i + nb.len()] == nb {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn parse_literal(text: &str) -> Result<SearchLiteral, ConfigError> {
    if let Some((from, to)) = split_range(text) {
        let from = parse_simple_literal(from)?;
        let to = parse_simple_literal(to)?;
        return Ok(SearchLiteral::Range(Box::new(from), Box::new(to)));
    }
    parse_simple_literal(text)
}

/// Split `a..b` outside quotes; `..` inside a quoted string is literal text.
fn split_range(text: &str) -> Option<(&str, &str)> {
    let at = find_outside_quotes(text, "..")?;
    Some((text[..at].trim(), text[at + 2..].trim()))
}

fn parse_simple_literal(text: &str) -> Result<SearchLiteral, ConfigError> {
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        let inner = &text[1..text.len() - 1];
        if let Some(prefix) = inner.strip_suffix('*') {
            return Ok(SearchLiteral::Wildcard(prefix.to_string()));
        }
        return Ok(SearchLiteral::Text(inner.to_string()));
    }
    if let Ok(v) = text.parse::<i64>() {
        return Ok(SearchLiteral::Number(v));
    }
    if let Some(prefix) = text.strip_suffix('*') {
        return Ok(SearchLiteral::Wildcard(prefix.to_string()));
    }
    Err(ConfigError::InvalidSearch {
        reason: format!("cannot parse literal: {text}"),
    })
}
