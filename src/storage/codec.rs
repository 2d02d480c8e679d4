//! Key and value codecs
//!
//! - [`DataExternalizer`]: serialize/deserialize contract for stored values
//! - [`KeyDescriptor`]: externalizer plus hashing and equality for keys
//! - [`KeyRepresentation`]: how a key is stored by the enumerator, chosen once
//!   when a store is built. `Inline` keys are small integers kept directly in the
//!   hash record, `Indirect` keys are serialized into the key stream.
//!
//! Serialized records must be self-delimiting: a reader positioned at the start
//! of a record has to find its end without outside help.

use crate::storage::error::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;

/// Upper bound for a single length-prefixed record
const MAX_RECORD_LEN: u64 = 64 * 1024 * 1024;

/// Serialize/deserialize contract for values
pub trait DataExternalizer<T>: Send + Sync {
    fn save(&self, out: &mut dyn Write, value: &T) -> StorageResult<()>;

    fn read(&self, input: &mut dyn Read) -> StorageResult<T>;
}

/// Hashing, equality and serialization contract for keys
pub trait KeyDescriptor<K>: DataExternalizer<K> {
    fn hash_code(&self, key: &K) -> i32;

    fn is_equal(&self, a: &K, b: &K) -> bool;
}

/// Key storage strategy
pub enum KeyRepresentation<K> {
    /// Key is an integer stored in place of a key-stream offset
    Inline {
        to_int: fn(&K) -> u32,
        from_int: fn(u32) -> K,
    },
    /// Key bytes live in the append-only key stream
    Indirect(Arc<dyn KeyDescriptor<K>>),
}

impl<K> Clone for KeyRepresentation<K> {
    fn clone(&self) -> Self {
        match self {
            KeyRepresentation::Inline { to_int, from_int } => KeyRepresentation::Inline {
                to_int: *to_int,
                from_int: *from_int,
            },
            KeyRepresentation::Indirect(descriptor) => {
                KeyRepresentation::Indirect(Arc::clone(descriptor))
            }
        }
    }
}

impl<K> KeyRepresentation<K> {
    pub fn indirect(descriptor: impl KeyDescriptor<K> + 'static) -> Self {
        KeyRepresentation::Indirect(Arc::new(descriptor))
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, KeyRepresentation::Inline { .. })
    }

    pub fn hash_code(&self, key: &K) -> i32 {
        match self {
            KeyRepresentation::Inline { to_int, .. } => to_int(key) as i32,
            KeyRepresentation::Indirect(descriptor) => descriptor.hash_code(key),
        }
    }

    /// Serialize a key outside the enumerator: inline keys as varints
    pub fn save_key(&self, out: &mut dyn Write, key: &K) -> StorageResult<()> {
        match self {
            KeyRepresentation::Inline { to_int, .. } => write_varint(out, u64::from(to_int(key))),
            KeyRepresentation::Indirect(descriptor) => descriptor.save(out, key),
        }
    }

    pub fn read_key(&self, input: &mut dyn Read) -> StorageResult<K> {
        match self {
            KeyRepresentation::Inline { from_int, .. } => {
                let value = read_varint(input)?;
                let value = u32::try_from(value).map_err(|_| {
                    StorageError::Serialization(format!("inline key {} out of range", value))
                })?;
                Ok(from_int(value))
            }
            KeyRepresentation::Indirect(descriptor) => descriptor.read(input),
        }
    }
}

impl KeyRepresentation<u32> {
    /// Integer keys stored inline
    pub fn inline_u32() -> Self {
        KeyRepresentation::Inline {
            to_int: |key| *key,
            from_int: |value| value,
        }
    }
}

// ==================== Varints ====================

/// Append an unsigned LEB128 varint to `buf`
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode a varint from the front of `buf`, returning the value and bytes consumed
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Encoded length of a varint
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

pub fn write_varint(out: &mut dyn Write, value: u64) -> StorageResult<()> {
    let mut buf = Vec::with_capacity(10);
    encode_varint(value, &mut buf);
    out.write_all(&buf)?;
    Ok(())
}

pub fn read_varint(input: &mut dyn Read) -> StorageResult<u64> {
    let mut value = 0u64;
    for i in 0..10 {
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte)?;
        value |= u64::from(byte[0] & 0x7F) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(StorageError::Serialization("varint longer than 10 bytes".into()))
}

fn read_len_prefixed(input: &mut dyn Read) -> StorageResult<Vec<u8>> {
    let len = read_varint(input)?;
    if len > MAX_RECORD_LEN {
        return Err(StorageError::Serialization(format!(
            "record length too large: {}",
            len
        )));
    }
    let mut data = vec![0u8; len as usize];
    input.read_exact(&mut data)?;
    Ok(data)
}

fn write_len_prefixed(out: &mut dyn Write, data: &[u8]) -> StorageResult<()> {
    write_varint(out, data.len() as u64)?;
    out.write_all(data)?;
    Ok(())
}

// ==================== Stock codecs ====================

/// UTF-8 strings, length-prefixed
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDescriptor;

impl DataExternalizer<String> for StringDescriptor {
    fn save(&self, out: &mut dyn Write, value: &String) -> StorageResult<()> {
        write_len_prefixed(out, value.as_bytes())
    }

    fn read(&self, input: &mut dyn Read) -> StorageResult<String> {
        let data = read_len_prefixed(input)?;
        String::from_utf8(data).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

impl KeyDescriptor<String> for StringDescriptor {
    fn hash_code(&self, key: &String) -> i32 {
        crc32fast::hash(key.as_bytes()) as i32
    }

    fn is_equal(&self, a: &String, b: &String) -> bool {
        a == b
    }
}

/// Raw byte strings, length-prefixed
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDescriptor;

impl DataExternalizer<Vec<u8>> for BytesDescriptor {
    fn save(&self, out: &mut dyn Write, value: &Vec<u8>) -> StorageResult<()> {
        write_len_prefixed(out, value)
    }

    fn read(&self, input: &mut dyn Read) -> StorageResult<Vec<u8>> {
        read_len_prefixed(input)
    }
}

impl KeyDescriptor<Vec<u8>> for BytesDescriptor {
    fn hash_code(&self, key: &Vec<u8>) -> i32 {
        crc32fast::hash(key) as i32
    }

    fn is_equal(&self, a: &Vec<u8>, b: &Vec<u8>) -> bool {
        a == b
    }
}

/// Fixed-width little-endian u32
#[derive(Debug, Clone, Copy, Default)]
pub struct U32Externalizer;

impl DataExternalizer<u32> for U32Externalizer {
    fn save(&self, out: &mut dyn Write, value: &u32) -> StorageResult<()> {
        out.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn read(&self, input: &mut dyn Read) -> StorageResult<u32> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

impl KeyDescriptor<u32> for U32Externalizer {
    fn hash_code(&self, key: &u32) -> i32 {
        *key as i32
    }

    fn is_equal(&self, a: &u32, b: &u32) -> bool {
        a == b
    }
}

/// Any serde value, bincode-encoded and length-prefixed
pub struct BincodeExternalizer<T>(PhantomData<fn() -> T>);

impl<T> BincodeExternalizer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BincodeExternalizer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DataExternalizer<T> for BincodeExternalizer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn save(&self, out: &mut dyn Write, value: &T) -> StorageResult<()> {
        let data = bincode::serialize(value)?;
        write_len_prefixed(out, &data)
    }

    fn read(&self, input: &mut dyn Read) -> StorageResult<T> {
        let data = read_len_prefixed(input)?;
        Ok(bincode::deserialize(&data)?)
    }
}

/// Serialize a value into a fresh buffer
pub fn to_bytes<T>(externalizer: &dyn DataExternalizer<T>, value: &T) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::new();
    externalizer.save(&mut buf, value)?;
    Ok(buf)
}
