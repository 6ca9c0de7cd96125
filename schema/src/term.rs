//! Typed terms in the peer's external serialization format.
//!
//! The control channel carries a small subset of the Erlang external
//! term format: integers, atoms, strings, binaries, tuples and proper
//! lists. This module models that subset as [`Term`] and implements the
//! byte-level codec both ways. Framing (the 2-byte length prefix) lives
//! in the `ipc` crate; this module only ever sees the payload of a
//! single frame.

use thiserror::Error;

/// Marker byte that starts every encoded term.
const VERSION: u8 = 131;

const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Errors produced while decoding or encoding a term.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TermError {
    #[error("term payload is truncated")]
    Truncated,
    #[error("missing or wrong version marker")]
    BadVersion,
    #[error("unsupported term tag {0}")]
    UnsupportedTag(u8),
    #[error("improper list tail")]
    ImproperList,
    #[error("integer out of supported range")]
    IntegerRange,
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),
    #[error("{0} too long to encode")]
    TooLong(&'static str),
    #[error("trailing bytes after term")]
    TrailingBytes,
}

/// One typed value on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Int(i64),
    Atom(String),
    Str(String),
    Bin(Vec<u8>),
    Tuple(Vec<Term>),
    List(Vec<Term>),
}

impl Term {
    /// Shorthand for an atom term.
    pub fn atom(name: &str) -> Term {
        Term::Atom(name.to_string())
    }

    /// Integer view of the term.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Atom view of the term.
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(a) => Some(a),
            _ => None,
        }
    }

    /// String view. The peer may spell text as a string, a binary, a
    /// character list, or the empty list; all of those are accepted.
    pub fn as_str(&self) -> Option<String> {
        match self {
            Term::Str(s) => Some(s.clone()),
            Term::Bin(b) => String::from_utf8(b.clone()).ok(),
            Term::List(items) if items.is_empty() => Some(String::new()),
            Term::List(items) => {
                let mut bytes = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_int() {
                        Some(c @ 0..=255) => bytes.push(c as u8),
                        _ => return None,
                    }
                }
                String::from_utf8(bytes).ok()
            }
            _ => None,
        }
    }

    /// Byte view: binaries and strings both qualify.
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Term::Bin(b) => Some(b.clone()),
            Term::Str(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        }
    }

    /// Tuple elements, if the term is a tuple.
    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// List elements, if the term is a (possibly empty) list.
    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            _ => None,
        }
    }

    /// Decode a full term payload (version marker included).
    pub fn decode(buf: &[u8]) -> Result<Term, TermError> {
        let mut r = Reader { buf, pos: 0 };
        if r.u8()? != VERSION {
            return Err(TermError::BadVersion);
        }
        let term = r.term()?;
        if r.pos != buf.len() {
            return Err(TermError::TrailingBytes);
        }
        Ok(term)
    }

    /// Encode the term into a fresh payload, version marker included.
    pub fn encode(&self) -> Result<Vec<u8>, TermError> {
        let mut out = Vec::with_capacity(32);
        out.push(VERSION);
        self.write(&mut out)?;
        Ok(out)
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), TermError> {
        match self {
            Term::Int(v) => write_int(*v, out),
            Term::Atom(name) => {
                let bytes = name.as_bytes();
                if bytes.len() > u8::MAX as usize {
                    return Err(TermError::TooLong("atom"));
                }
                out.push(SMALL_ATOM_UTF8_EXT);
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
                Ok(())
            }
            Term::Str(s) if s.is_empty() => {
                out.push(NIL_EXT);
                Ok(())
            }
            Term::Str(s) => {
                let bytes = s.as_bytes();
                if bytes.len() > u16::MAX as usize {
                    return Err(TermError::TooLong("string"));
                }
                out.push(STRING_EXT);
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(bytes);
                Ok(())
            }
            Term::Bin(b) => {
                out.push(BINARY_EXT);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
                Ok(())
            }
            Term::Tuple(items) => {
                if items.len() <= u8::MAX as usize {
                    out.push(SMALL_TUPLE_EXT);
                    out.push(items.len() as u8);
                } else {
                    out.push(LARGE_TUPLE_EXT);
                    out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                }
                for item in items {
                    item.write(out)?;
                }
                Ok(())
            }
            Term::List(items) if items.is_empty() => {
                out.push(NIL_EXT);
                Ok(())
            }
            Term::List(items) => {
                out.push(LIST_EXT);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    item.write(out)?;
                }
                out.push(NIL_EXT);
                Ok(())
            }
        }
    }
}

fn write_int(v: i64, out: &mut Vec<u8>) -> Result<(), TermError> {
    if (0..=255).contains(&v) {
        out.push(SMALL_INTEGER_EXT);
        out.push(v as u8);
    } else if (i32::MIN as i64..=i32::MAX as i64).contains(&v) {
        out.push(INTEGER_EXT);
        out.extend_from_slice(&(v as i32).to_be_bytes());
    } else {
        // Big integers: magnitude in little-endian bytes, sign first.
        let sign = u8::from(v < 0);
        let magnitude = v.unsigned_abs().to_le_bytes();
        let used = magnitude.iter().rposition(|b| *b != 0).map_or(1, |i| i + 1);
        out.push(SMALL_BIG_EXT);
        out.push(used as u8);
        out.push(sign);
        out.extend_from_slice(&magnitude[..used]);
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, TermError> {
        let b = *self.buf.get(self.pos).ok_or(TermError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, TermError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32, TermError> {
        Ok(u32::from_be_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TermError> {
        let end = self.pos.checked_add(n).ok_or(TermError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(TermError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn term(&mut self) -> Result<Term, TermError> {
        match self.u8()? {
            SMALL_INTEGER_EXT => Ok(Term::Int(i64::from(self.u8()?))),
            INTEGER_EXT => {
                let raw = self.take(4)?;
                Ok(Term::Int(i64::from(i32::from_be_bytes([
                    raw[0], raw[1], raw[2], raw[3],
                ]))))
            }
            SMALL_BIG_EXT => {
                let n = self.u8()? as usize;
                let sign = self.u8()?;
                let digits = self.take(n)?;
                if n > 8 && digits[8..].iter().any(|b| *b != 0) {
                    return Err(TermError::IntegerRange);
                }
                let mut magnitude = [0u8; 8];
                magnitude[..n.min(8)].copy_from_slice(&digits[..n.min(8)]);
                let value = u64::from_le_bytes(magnitude);
                if sign == 0 {
                    i64::try_from(value).map(Term::Int).map_err(|_| TermError::IntegerRange)
                } else if value <= i64::MIN.unsigned_abs() {
                    Ok(Term::Int(value.wrapping_neg() as i64))
                } else {
                    Err(TermError::IntegerRange)
                }
            }
            ATOM_EXT | ATOM_UTF8_EXT => {
                let len = self.u16()? as usize;
                let raw = self.take(len)?;
                let name = String::from_utf8(raw.to_vec()).map_err(|_| TermError::Utf8("atom"))?;
                Ok(Term::Atom(name))
            }
            SMALL_ATOM_UTF8_EXT => {
                let len = self.u8()? as usize;
                let raw = self.take(len)?;
                let name = String::from_utf8(raw.to_vec()).map_err(|_| TermError::Utf8("atom"))?;
                Ok(Term::Atom(name))
            }
            STRING_EXT => {
                let len = self.u16()? as usize;
                let raw = self.take(len)?;
                let s = String::from_utf8(raw.to_vec()).map_err(|_| TermError::Utf8("string"))?;
                Ok(Term::Str(s))
            }
            NIL_EXT => Ok(Term::List(Vec::new())),
            LIST_EXT => {
                let count = self.u32()? as usize;
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.term()?);
                }
                if self.u8()? != NIL_EXT {
                    return Err(TermError::ImproperList);
                }
                Ok(Term::List(items))
            }
            SMALL_TUPLE_EXT => {
                let arity = self.u8()? as usize;
                self.tuple(arity)
            }
            LARGE_TUPLE_EXT => {
                let arity = self.u32()? as usize;
                self.tuple(arity)
            }
            BINARY_EXT => {
                let len = self.u32()? as usize;
                Ok(Term::Bin(self.take(len)?.to_vec()))
            }
            other => Err(TermError::UnsupportedTag(other)),
        }
    }

    fn tuple(&mut self, arity: usize) -> Result<Term, TermError> {
        let mut items = Vec::with_capacity(arity.min(4096));
        for _ in 0..arity {
            items.push(self.term()?);
        }
        Ok(Term::Tuple(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(term: Term) {
        let bytes = term.encode().expect("encode");
        assert_eq!(Term::decode(&bytes).expect("decode"), term);
    }

    #[test]
    fn test_integer_round_trips() {
        for v in [0, 1, 255, 256, -1, i32::MAX as i64, i32::MIN as i64, i64::MAX, i64::MIN] {
            round_trip(Term::Int(v));
        }
    }

    #[test]
    fn test_small_integer_wire_form() {
        assert_eq!(Term::Int(7).encode().unwrap(), vec![131, 97, 7]);
        assert_eq!(Term::Int(-2).encode().unwrap(), vec![131, 98, 255, 255, 255, 254]);
    }

    #[test]
    fn test_atom_string_binary_round_trips() {
        round_trip(Term::atom("ok"));
        round_trip(Term::Str("hello world".to_string()));
        round_trip(Term::Bin(vec![0, 1, 2, 254, 255]));
        round_trip(Term::Bin(Vec::new()));
    }

    #[test]
    fn test_nested_round_trip() {
        round_trip(Term::Tuple(vec![
            Term::Int(0),
            Term::Tuple(vec![
                Term::atom("exit_status"),
                Term::Int(12345),
                Term::Int(0),
            ]),
        ]));
        round_trip(Term::List(vec![Term::Int(1), Term::atom("x"), Term::List(Vec::new())]));
    }

    #[test]
    fn test_empty_string_encodes_as_nil() {
        assert_eq!(Term::Str(String::new()).encode().unwrap(), vec![131, 106]);
    }

    #[test]
    fn test_decodes_legacy_atom_tags() {
        // ATOM_EXT with a u16 length, as older peers emit.
        let buf = [131, 100, 0, 2, b'o', b'k'];
        assert_eq!(Term::decode(&buf).unwrap(), Term::atom("ok"));
        // SMALL_ATOM_UTF8_EXT, the modern spelling.
        let buf = [131, 119, 2, b'o', b'k'];
        assert_eq!(Term::decode(&buf).unwrap(), Term::atom("ok"));
    }

    #[test]
    fn test_char_list_reads_as_string() {
        let term = Term::List(vec![Term::Int(104), Term::Int(105)]);
        assert_eq!(term.as_str().as_deref(), Some("hi"));
        assert_eq!(Term::List(Vec::new()).as_str().as_deref(), Some(""));
    }

    #[test]
    fn test_truncated_payloads_rejected() {
        let full = Term::Tuple(vec![Term::Int(1), Term::Str("abc".into())])
            .encode()
            .unwrap();
        for cut in 0..full.len() {
            assert!(Term::decode(&full[..cut]).is_err(), "cut at {cut} should fail");
        }
    }

    #[test]
    fn test_bad_version_and_tag_rejected() {
        assert_eq!(Term::decode(&[130, 97, 1]), Err(TermError::BadVersion));
        assert_eq!(Term::decode(&[131, 70, 0]), Err(TermError::UnsupportedTag(70)));
    }

    #[test]
    fn test_improper_list_rejected() {
        // [1 | 2]: the tail is an integer instead of NIL.
        let buf = [131, 108, 0, 0, 0, 1, 97, 1, 97, 2];
        assert_eq!(Term::decode(&buf), Err(TermError::ImproperList));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = Term::Int(1).encode().unwrap();
        buf.push(0);
        assert_eq!(Term::decode(&buf), Err(TermError::TrailingBytes));
    }
}
