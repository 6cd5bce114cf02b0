//! Encoder producing the same wire layout the decoder reads.
//!
//! The relay only sends values to clients, so this is used to build frames
//! for tests and replay tooling.

use bytes::{BufMut, BytesMut};

use crate::decode::ABSENT_LENGTH;
use crate::value::*;

/// Writes a type tag followed by the value
pub fn encode_object(value: &Value, dst: &mut BytesMut) {
    put_tag(value.type_tag(), dst);
    encode_value(value, dst);
}

/// Writes the value without its type tag
pub fn encode_value(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::Char(c) => dst.put_u8(*c),
        Value::Int(i) => dst.put_i32(*i),
        Value::Long(l) => put_digits(l.as_str(), dst),
        Value::Str(s) => put_string(s.as_deref(), dst),
        Value::Buffer(b) => put_sized(b.as_deref(), dst),
        Value::Pointer(p) => put_pointer(p.as_deref(), dst),
        Value::Time(t) => put_digits(&t.timestamp().to_string(), dst),
        Value::HashTable(table) => {
            put_tag(table.key_type, dst);
            put_tag(table.value_type, dst);
            dst.put_u32(table.entries.len() as u32);
            for (key, value) in &table.entries {
                encode_value(key, dst);
                encode_value(value, dst);
            }
        }
        Value::Array(array) => {
            put_tag(array.element_type, dst);
            dst.put_u32(array.items.len() as u32);
            for item in &array.items {
                encode_value(item, dst);
            }
        }
        Value::Info(info) => {
            put_string(info.name.as_deref(), dst);
            put_string(info.value.as_deref(), dst);
        }
        Value::InfoList(list) => {
            put_string(list.name.as_deref(), dst);
            dst.put_u8(list.items.len() as u8);
            for item in &list.items {
                dst.put_u8(item.fields.len() as u8);
                for (name, value) in &item.fields {
                    put_string(name.as_deref(), dst);
                    encode_object(value, dst);
                }
            }
        }
        Value::HData(hdata) => {
            put_string(Some(&hdata.path.join("/")), dst);
            let keys = hdata
                .keys
                .iter()
                .map(|(name, tag)| format!("{}:{}", name, tag))
                .collect::<Vec<_>>()
                .join(",");
            put_string(Some(&keys), dst);
            dst.put_u32(hdata.records.len() as u32);
            for record in &hdata.records {
                for pointer in &record.pointers {
                    put_pointer(pointer.as_deref(), dst);
                }
                for (_, value) in &record.values {
                    encode_value(value, dst);
                }
            }
        }
    }
}

pub fn put_tag(tag: TypeTag, dst: &mut BytesMut) {
    dst.put_slice(tag.as_str().as_bytes());
}

pub fn put_string(s: Option<&str>, dst: &mut BytesMut) {
    put_sized(s.map(str::as_bytes), dst);
}

fn put_sized(data: Option<&[u8]>, dst: &mut BytesMut) {
    match data {
        None => dst.put_u32(ABSENT_LENGTH),
        Some(data) => {
            dst.put_u32(data.len() as u32);
            dst.put_slice(data);
        }
    }
}

/// Pointers must be hex digits, with or without a `0x` prefix
fn put_pointer(pointer: Option<&str>, dst: &mut BytesMut) {
    match pointer {
        None => dst.put_slice(&[1, 0]),
        Some(p) => {
            let digits = p.strip_prefix("0x").unwrap_or(p);
            debug_assert!(
                !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_hexdigit()),
                "pointer {:?} is not hexadecimal",
                p
            );
            dst.put_u8(digits.len() as u8);
            dst.put_slice(digits.as_bytes());
        }
    }
}

fn put_digits(digits: &str, dst: &mut BytesMut) {
    dst.put_u8(digits.len() as u8);
    dst.put_slice(digits.as_bytes());
}
