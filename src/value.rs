//! Named values attached to a cache entry.
//!
//! Values are a closed set of kinds so that metadata records can be decoded
//! without knowing anything about the caller. Caller-defined structures go
//! through [`ExtensionValue`], which supplies its own encode/decode pair; the
//! bytes stay opaque until the caller asks for them back with the same type.
use crate::error::{CacheError, Result};
use bincode::{Decode, Encode};
use std::{collections::BTreeMap, fmt};

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    /// Set-like map of flags, e.g. which symbols a generated file provides
    Flags(BTreeMap<String, bool>),
    List(Vec<String>),
    /// Caller-defined payload tagged with [`ExtensionValue::KIND`]
    Extension { kind: String, data: Vec<u8> },
}

/// A caller-defined value type that can be stored in an entry.
///
/// `KIND` must be unique per type; it is checked on decode so a value is
/// never handed back as the wrong type.
pub trait ExtensionValue: Sized {
    const KIND: &'static str;

    fn encode(&self) -> std::result::Result<Vec<u8>, String>;

    fn decode(data: &[u8]) -> std::result::Result<Self, String>;
}

impl Value {
    pub fn kind(&self) -> &str {
        match self {
            Self::Str(_) => "str",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Flags(_) => "flags",
            Self::List(_) => "list",
            Self::Extension { kind, .. } => kind,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub const fn as_flags(&self) -> Option<&BTreeMap<String, bool>> {
        match self {
            Self::Flags(flags) => Some(flags),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Wraps a caller-defined value.
    pub fn extension<T: ExtensionValue>(value: &T) -> Result<Self> {
        let data = value.encode().map_err(|reason| CacheError::Extension {
            kind: T::KIND.to_owned(),
            reason,
        })?;
        Ok(Self::Extension {
            kind: T::KIND.to_owned(),
            data,
        })
    }

    /// Decodes an extension value as `T`.
    ///
    /// Returns `Ok(None)` if this is not an extension of kind `T::KIND`.
    pub fn decode_extension<T: ExtensionValue>(&self) -> Result<Option<T>> {
        match self {
            Self::Extension { kind, data } if kind == T::KIND => T::decode(data)
                .map(Some)
                .map_err(|reason| CacheError::Extension {
                    kind: kind.clone(),
                    reason,
                }),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Flags(flags) => {
                let set: Vec<&str> = flags
                    .iter()
                    .filter(|(_, on)| **on)
                    .map(|(name, _)| name.as_str())
                    .collect();
                write!(f, "{{{}}}", set.join(", "))
            }
            Self::List(items) => write!(f, "[{}]", items.join(", ")),
            Self::Extension { kind, data } => write!(f, "<{kind}: {} bytes>", data.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<BTreeMap<String, bool>> for Value {
    fn from(flags: BTreeMap<String, bool>) -> Self {
        Self::Flags(flags)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Span {
        start: u32,
        end: u32,
    }

    impl ExtensionValue for Span {
        const KIND: &'static str = "test.span";

        fn encode(&self) -> std::result::Result<Vec<u8>, String> {
            Ok([self.start.to_le_bytes(), self.end.to_le_bytes()].concat())
        }

        fn decode(data: &[u8]) -> std::result::Result<Self, String> {
            let bytes: [u8; 8] = data
                .try_into()
                .map_err(|_| format!("expected 8 bytes, got {}", data.len()))?;
            let (start, end) = bytes.split_at(4);
            Ok(Self {
                start: u32::from_le_bytes(start.try_into().map_err(|_| "start")?),
                end: u32::from_le_bytes(end.try_into().map_err(|_| "end")?),
            })
        }
    }

    #[test]
    fn test_accessors_match_kind() {
        let value = Value::from("hello");
        assert_eq!(value.kind(), "str");
        assert_eq!(value.as_str(), Some("hello"));
        assert_eq!(value.as_bool(), None);

        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::from(-4i64).as_int(), Some(-4));
        let list = Value::from(vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(list.as_list().map(<[String]>::len), Some(2));
    }

    #[test]
    fn test_extension_round_trip() {
        let span = Span { start: 3, end: 9 };
        let value = Value::extension(&span).unwrap();
        assert_eq!(value.kind(), "test.span");
        assert_eq!(value.decode_extension::<Span>().unwrap(), Some(span));
    }

    #[test]
    fn test_extension_kind_mismatch_is_none() {
        assert_eq!(Value::from("x").decode_extension::<Span>().unwrap(), None);

        let other = Value::Extension {
            kind: "other".to_owned(),
            data: vec![0; 8],
        };
        assert_eq!(other.decode_extension::<Span>().unwrap(), None);
    }

    #[test]
    fn test_extension_decode_error() {
        let broken = Value::Extension {
            kind: Span::KIND.to_owned(),
            data: vec![1, 2, 3],
        };
        assert!(matches!(
            broken.decode_extension::<Span>(),
            Err(CacheError::Extension { .. })
        ));
    }

    #[test]
    fn test_display_flags() {
        let flags = BTreeMap::from([
            ("Close".to_owned(), true),
            ("Open".to_owned(), true),
            ("Unused".to_owned(), false),
        ]);
        assert_eq!(Value::from(flags).to_string(), "{Close, Open}");
    }
}
