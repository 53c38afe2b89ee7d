use crate::error::{Error, Result};
use crate::value::{PropertyValue, TemporalKind, TemporalValue};

// Little-endian primitives shared by the WAL and snapshot codecs. Strings
// and composite values are length-prefixed so a reader can always tell a
// truncated frame from a bad one.

pub(crate) fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_f64(buf: &mut Vec<u8>, value: f64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

pub(crate) fn put_value(buf: &mut Vec<u8>, value: &PropertyValue) {
    match value {
        PropertyValue::Null => put_u8(buf, 0),
        PropertyValue::Bool(inner) => {
            put_u8(buf, 1);
            put_u8(buf, u8::from(*inner));
        }
        PropertyValue::Int(inner) => {
            put_u8(buf, 2);
            put_i64(buf, *inner);
        }
        PropertyValue::Double(inner) => {
            put_u8(buf, 3);
            put_f64(buf, *inner);
        }
        PropertyValue::String(inner) => {
            put_u8(buf, 4);
            put_string(buf, inner);
        }
        PropertyValue::List(items) => {
            put_u8(buf, 5);
            put_u32(buf, items.len() as u32);
            for item in items {
                put_value(buf, item);
            }
        }
        PropertyValue::Map(entries) => {
            put_u8(buf, 6);
            put_u32(buf, entries.len() as u32);
            for (key, item) in entries {
                put_string(buf, key);
                put_value(buf, item);
            }
        }
        PropertyValue::Temporal(temporal) => {
            put_u8(buf, 7);
            let kind = match temporal.kind {
                TemporalKind::Date => 0u8,
                TemporalKind::LocalTime => 1,
                TemporalKind::LocalDateTime => 2,
                TemporalKind::Duration => 3,
            };
            put_u8(buf, kind);
            put_i64(buf, temporal.microseconds);
        }
    }
}

fn corrupt(what: &str) -> Error {
    Error::Recovery(format!("corrupt durable data: {what}"))
}

/// Cursor over an encoded byte slice. Every read is bounds-checked and
/// surfaces truncation as a recovery error.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(corrupt("unexpected end of data"));
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.read_bytes(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.read_bytes(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("invalid utf-8 string"))
    }

    pub(crate) fn read_value(&mut self) -> Result<PropertyValue> {
        match self.read_u8()? {
            0 => Ok(PropertyValue::Null),
            1 => Ok(PropertyValue::Bool(self.read_u8()? != 0)),
            2 => Ok(PropertyValue::Int(self.read_i64()?)),
            3 => Ok(PropertyValue::Double(self.read_f64()?)),
            4 => Ok(PropertyValue::String(self.read_string()?)),
            5 => {
                let len = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Ok(PropertyValue::List(items))
            }
            6 => {
                let len = self.read_u32()? as usize;
                let mut entries = std::collections::BTreeMap::new();
                for _ in 0..len {
                    let key = self.read_string()?;
                    let item = self.read_value()?;
                    entries.insert(key, item);
                }
                Ok(PropertyValue::Map(entries))
            }
            7 => {
                let kind = match self.read_u8()? {
                    0 => TemporalKind::Date,
                    1 => TemporalKind::LocalTime,
                    2 => TemporalKind::LocalDateTime,
                    3 => TemporalKind::Duration,
                    _ => return Err(corrupt("unknown temporal kind")),
                };
                Ok(PropertyValue::Temporal(TemporalValue {
                    kind,
                    microseconds: self.read_i64()?,
                }))
            }
            _ => Err(corrupt("unknown property value tag")),
        }
    }
}

pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
