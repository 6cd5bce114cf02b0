//! Recursive-descent decoder for typed relay values.
//!
//! Each type tag maps to exactly one decode function through [`decoder_for`];
//! the composite types (`htb`, `arr`, `inl`, `hda`) call back into the same
//! table for their members.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::value::*;
use crate::DecodeError;

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Length sentinel marking an absent `str` or `buf`
pub const ABSENT_LENGTH: u32 = 0xFFFF_FFFF;

/// Deepest value nesting accepted
pub const MAX_DEPTH: usize = 64;

type DecodeFn = fn(&mut Cursor<'_>) -> DecodeResult<Value>;

/// Read position over a borrowed byte slice.
///
/// Every read checks the remaining length first, so a failed read leaves the
/// cursor where it was. The cursor also tracks how deeply the value being
/// decoded is nested.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, depth: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a 4-byte length or count. Network byte order: the first byte is
    /// the most significant.
    pub fn read_u32(&mut self) -> DecodeResult<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_tag(&mut self) -> DecodeResult<TypeTag> {
        TypeTag::from_bytes(self.take(3)?)
    }
}

/// Maps a type tag to its decode function
fn decoder_for(tag: TypeTag) -> DecodeFn {
    match tag {
        TypeTag::Chr => decode_chr,
        TypeTag::Int => decode_int,
        TypeTag::Lon => decode_lon,
        TypeTag::Str => decode_str,
        TypeTag::Buf => decode_buf,
        TypeTag::Tim => decode_tim,
        TypeTag::Ptr => decode_ptr,
        TypeTag::Htb => decode_htb,
        TypeTag::Hda => decode_hda,
        TypeTag::Inf => decode_inf,
        TypeTag::Inl => decode_inl,
        TypeTag::Arr => decode_arr,
    }
}

/// Decodes one value of type `tag` starting at the cursor
pub fn decode_value(cursor: &mut Cursor<'_>, tag: TypeTag) -> DecodeResult<Value> {
    if cursor.depth >= MAX_DEPTH {
        return Err(DecodeError::TooDeep(MAX_DEPTH));
    }

    cursor.depth += 1;
    let value = decoder_for(tag)(cursor);
    cursor.depth -= 1;
    value
}

/// Decodes a type tag followed by a value of that type
pub fn decode_object(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    let tag = cursor.read_tag()?;
    decode_value(cursor, tag)
}

fn decode_chr(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    Ok(Value::Char(cursor.read_u8()?))
}

fn decode_int(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    Ok(Value::Int(cursor.read_u32()? as i32))
}

fn decode_lon(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    let digits = read_digits(cursor, "lon")?;
    LongInteger::parse(digits)
        .map(Value::Long)
        .ok_or_else(|| DecodeError::InvalidDigits("lon", digits.to_string()))
}

fn decode_str(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    Ok(Value::Str(read_string(cursor)?))
}

fn decode_buf(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    let data = read_sized(cursor)?.map(Bytes::copy_from_slice);
    Ok(Value::Buffer(data))
}

fn decode_tim(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    let secs = read_decimal(cursor, "tim")?;
    let instant: DateTime<Utc> = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DecodeError::InvalidDigits("tim", secs.to_string()))?;
    Ok(Value::Time(instant))
}

fn decode_ptr(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    Ok(Value::Pointer(read_pointer(cursor)?))
}

fn decode_htb(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    let key_type = cursor.read_tag()?;
    let value_type = cursor.read_tag()?;
    let count = cursor.read_u32()? as usize;

    let mut entries = Vec::with_capacity(count.min(cursor.remaining()));
    for _ in 0..count {
        let key = decode_value(cursor, key_type)?;
        let value = decode_value(cursor, value_type)?;
        entries.push((key, value));
    }

    Ok(Value::HashTable(HashTable {
        key_type,
        value_type,
        entries,
    }))
}

fn decode_arr(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    let element_type = cursor.read_tag()?;
    let count = cursor.read_u32()? as usize;

    let mut items = Vec::with_capacity(count.min(cursor.remaining()));
    for _ in 0..count {
        items.push(decode_value(cursor, element_type)?);
    }

    Ok(Value::Array(Array {
        element_type,
        items,
    }))
}

fn decode_inf(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    let name = read_string(cursor)?;
    let value = read_string(cursor)?;
    Ok(Value::Info(Info { name, value }))
}

fn decode_inl(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    let name = read_string(cursor)?;
    let count = cursor.read_u8()?;

    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let field_count = cursor.read_u8()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let field_name = read_string(cursor)?;
            let value = decode_object(cursor)?;
            fields.push((field_name, value));
        }
        items.push(InfoListItem { fields });
    }

    Ok(Value::InfoList(InfoList { name, items }))
}

fn decode_hda(cursor: &mut Cursor<'_>) -> DecodeResult<Value> {
    let path = read_hpath(cursor)?;
    let keys = read_hkeys(cursor)?;
    let count = cursor.read_u32()? as usize;

    let mut records = Vec::with_capacity(count.min(cursor.remaining()));
    for _ in 0..count {
        let mut pointers = Vec::with_capacity(path.len());
        for _ in &path {
            pointers.push(read_pointer(cursor)?);
        }

        let mut values = Vec::with_capacity(keys.len());
        for (name, tag) in &keys {
            values.push((name.clone(), decode_value(cursor, *tag)?));
        }

        records.push(HDataRecord { pointers, values });
    }

    Ok(Value::HData(HData {
        path,
        keys,
        records,
    }))
}

/// `buffer/lines/line/line_data` -> four segments; absent or empty -> none
pub fn read_hpath(cursor: &mut Cursor<'_>) -> DecodeResult<Vec<String>> {
    Ok(match read_string(cursor)? {
        Some(path) if !path.is_empty() => path.split('/').map(str::to_string).collect(),
        _ => Vec::new(),
    })
}

/// `number:int,full_name:str` -> `[("number", Int), ("full_name", Str)]`
pub fn read_hkeys(cursor: &mut Cursor<'_>) -> DecodeResult<Vec<(String, TypeTag)>> {
    let raw = match read_string(cursor)? {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(Vec::new()),
    };

    raw.split(',')
        .map(|entry| {
            let (name, tag) = entry
                .split_once(':')
                .ok_or_else(|| DecodeError::InvalidHKey(entry.to_string()))?;
            if name.is_empty() {
                return Err(DecodeError::InvalidHKey(entry.to_string()));
            }
            Ok((name.to_string(), TypeTag::from_bytes(tag.as_bytes())?))
        })
        .collect()
}

/// Length-prefixed bytes, `None` for the all-ones sentinel
fn read_sized<'a>(cursor: &mut Cursor<'a>) -> DecodeResult<Option<&'a [u8]>> {
    let len = cursor.read_u32()?;
    if len == ABSENT_LENGTH {
        return Ok(None);
    }
    cursor.take(len as usize).map(Some)
}

pub fn read_string(cursor: &mut Cursor<'_>) -> DecodeResult<Option<String>> {
    match read_sized(cursor)? {
        None => Ok(None),
        Some(raw) => std::str::from_utf8(raw)
            .map(|s| Some(s.to_string()))
            .map_err(|_| DecodeError::InvalidUtf8("str")),
    }
}

pub fn read_pointer(cursor: &mut Cursor<'_>) -> DecodeResult<Option<String>> {
    let len = cursor.read_u8()?;
    if len == 0 {
        return Err(DecodeError::InvalidLength(0));
    }

    let raw = cursor.take(len as usize)?;
    if raw == [0u8] {
        return Ok(None);
    }
    if !raw.iter().all(u8::is_ascii_hexdigit) {
        return Err(DecodeError::InvalidDigits(
            "ptr",
            String::from_utf8_lossy(raw).into_owned(),
        ));
    }

    // all bytes are ASCII hex digits, so this cannot fail
    let digits = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8("ptr"))?;
    Ok(Some(format!("0x{}", digits)))
}

/// One length byte followed by that many ASCII bytes
fn read_digits<'a>(cursor: &mut Cursor<'a>, kind: &'static str) -> DecodeResult<&'a str> {
    let len = cursor.read_u8()? as usize;
    let raw = cursor.take(len)?;
    std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8(kind))
}

fn read_decimal(cursor: &mut Cursor<'_>, kind: &'static str) -> DecodeResult<i64> {
    let text = read_digits(cursor, kind)?;
    text.parse::<i64>()
        .map_err(|_| DecodeError::InvalidDigits(kind, text.to_string()))
}
