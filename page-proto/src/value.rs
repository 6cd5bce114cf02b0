use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::DecodeError;

/// Three-letter type tags used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Chr,
    Int,
    Lon,
    Str,
    Buf,
    Tim,
    Ptr,
    Htb,
    Hda,
    Inf,
    Inl,
    Arr,
}

impl TypeTag {
    pub const ALL: [TypeTag; 12] = [
        TypeTag::Chr,
        TypeTag::Int,
        TypeTag::Lon,
        TypeTag::Str,
        TypeTag::Buf,
        TypeTag::Tim,
        TypeTag::Ptr,
        TypeTag::Htb,
        TypeTag::Hda,
        TypeTag::Inf,
        TypeTag::Inl,
        TypeTag::Arr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::Chr => "chr",
            TypeTag::Int => "int",
            TypeTag::Lon => "lon",
            TypeTag::Str => "str",
            TypeTag::Buf => "buf",
            TypeTag::Tim => "tim",
            TypeTag::Ptr => "ptr",
            TypeTag::Htb => "htb",
            TypeTag::Hda => "hda",
            TypeTag::Inf => "inf",
            TypeTag::Inl => "inl",
            TypeTag::Arr => "arr",
        }
    }

    pub fn from_bytes(raw: &[u8]) -> std::result::Result<Self, DecodeError> {
        Self::ALL
            .into_iter()
            .find(|tag| tag.as_str().as_bytes() == raw)
            .ok_or_else(|| DecodeError::UnknownType(String::from_utf8_lossy(raw).into_owned()))
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decimal integer of any width, kept as the digits read from the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LongInteger(String);

impl LongInteger {
    /// Accepts an optional `-` followed by at least one ASCII digit
    pub fn parse(text: &str) -> Option<Self> {
        let digits = text.strip_prefix('-').unwrap_or(text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The value when it fits a C `long` on 64-bit platforms
    pub fn to_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl From<i64> for LongInteger {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

impl fmt::Display for LongInteger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One decoded protocol value.
///
/// `Str`, `Buffer` and `Pointer` keep the absent case (`None`) apart from an
/// empty present value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Char(u8),
    Int(i32),
    Long(LongInteger),
    Str(Option<String>),
    Buffer(Option<Bytes>),
    Pointer(Option<String>),
    Time(DateTime<Utc>),
    HashTable(HashTable),
    Array(Array),
    Info(Info),
    InfoList(InfoList),
    HData(HData),
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Char(_) => TypeTag::Chr,
            Value::Int(_) => TypeTag::Int,
            Value::Long(_) => TypeTag::Lon,
            Value::Str(_) => TypeTag::Str,
            Value::Buffer(_) => TypeTag::Buf,
            Value::Pointer(_) => TypeTag::Ptr,
            Value::Time(_) => TypeTag::Tim,
            Value::HashTable(_) => TypeTag::Htb,
            Value::Array(_) => TypeTag::Arr,
            Value::Info(_) => TypeTag::Inf,
            Value::InfoList(_) => TypeTag::Inl,
            Value::HData(_) => TypeTag::Hda,
        }
    }

    /// Present string contents, `None` for other types or the absent string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&str> {
        match self {
            Value::Pointer(Some(p)) => Some(p),
            _ => None,
        }
    }

    /// Truthiness of a `chr` flag or `int` value
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::Char(c) => Some(*c != 0),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_hashtable(&self) -> Option<&HashTable> {
        match self {
            Value::HashTable(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_hdata(&self) -> Option<&HData> {
        match self {
            Value::HData(h) => Some(h),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashTable {
    pub key_type: TypeTag,
    pub value_type: TypeTag,
    pub entries: Vec<(Value, Value)>,
}

impl HashTable {
    /// First value whose key is the present string `key`
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub element_type: TypeTag,
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub name: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfoList {
    pub name: Option<String>,
    pub items: Vec<InfoListItem>,
}

/// One infolist record: named attributes in wire order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InfoListItem {
    pub fields: Vec<(Option<String>, Value)>,
}

impl InfoListItem {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n.as_deref() == Some(name))
            .map(|(_, v)| v)
    }
}

/// A batch of remote objects sharing one path and one key set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HData {
    pub path: Vec<String>,
    pub keys: Vec<(String, TypeTag)>,
    pub records: Vec<HDataRecord>,
}

/// One object of an [`HData`] batch.
///
/// `pointers` holds one entry per path segment, `values` one entry per key,
/// both in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HDataRecord {
    pub pointers: Vec<Option<String>>,
    pub values: Vec<(String, Value)>,
}

impl HDataRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Pointer of the innermost path segment
    pub fn object_pointer(&self) -> Option<&str> {
        self.pointers.last().and_then(|p| p.as_deref())
    }

    /// Pointer of the outermost path segment (the buffer for `buffer/...` paths)
    pub fn root_pointer(&self) -> Option<&str> {
        self.pointers.first().and_then(|p| p.as_deref())
    }
}
