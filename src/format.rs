//! Internal key and value record encodings.
//!
//! A user key becomes an internal key by appending the bitwise-NOT of its
//! 8-byte big-endian version, so plain byte comparison orders internal keys
//! by user key ascending, then version descending. The newest version of a
//! key therefore sorts first.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Record is a tombstone.
pub const BIT_DELETE: u8 = 1 << 0;
/// The value lives in the external value log; only the tag is stored here.
pub const BIT_VALUE_POINTER: u8 = 1 << 1;

pub const VERSION_SUFFIX_LEN: usize = 8;

/// Append the version suffix to a user key.
pub fn encode_internal(user_key: &[u8], version: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(user_key.len() + VERSION_SUFFIX_LEN);
    buf.put_slice(user_key);
    buf.put_u64(!version);
    buf.freeze()
}

pub fn encode_internal_into(buf: &mut Vec<u8>, user_key: &[u8], version: u64) {
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&(!version).to_be_bytes());
}

/// Split an internal key into (user key, version).
pub fn split_internal(internal: &[u8]) -> (&[u8], u64) {
    debug_assert!(internal.len() >= VERSION_SUFFIX_LEN);
    let split = internal.len() - VERSION_SUFFIX_LEN;
    let version = !BigEndian::read_u64(&internal[split..]);
    (&internal[..split], version)
}

pub fn user_key(internal: &[u8]) -> &[u8] {
    &internal[..internal.len() - VERSION_SUFFIX_LEN]
}

/// A versioned value record: meta byte, user meta, commit version and the
/// value bytes. The encoded form is what memtables and table blocks store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub meta: u8,
    pub user_meta: Bytes,
    pub version: u64,
    pub value: Bytes,
}

impl Value {
    pub fn new(version: u64, value: impl Into<Bytes>) -> Self {
        Self {
            meta: 0,
            user_meta: Bytes::new(),
            version,
            value: value.into(),
        }
    }

    pub fn tombstone(version: u64) -> Self {
        Self {
            meta: BIT_DELETE,
            user_meta: Bytes::new(),
            version,
            value: Bytes::new(),
        }
    }

    pub fn with_user_meta(mut self, user_meta: impl Into<Bytes>) -> Self {
        self.user_meta = user_meta.into();
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    /// Stable size of the encoded record, used for size accounting.
    pub fn encoded_size(&self) -> usize {
        1 + 1 + self.user_meta.len() + 8 + self.value.len()
    }

    /// Layout: meta u8 | user_meta_len u8 | user_meta | version u64 BE | value.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(self.meta);
        buf.put_u8(self.user_meta.len() as u8);
        buf.put_slice(&self.user_meta);
        buf.put_u64(self.version);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    pub fn decode(buf: Bytes) -> Result<Self> {
        if buf.len() < 10 {
            return Err(Error::CorruptFile("short value record".into()));
        }
        let meta = buf[0];
        let um_len = buf[1] as usize;
        if buf.len() < 2 + um_len + 8 {
            return Err(Error::CorruptFile("truncated value record".into()));
        }
        let user_meta = buf.slice(2..2 + um_len);
        let version = BigEndian::read_u64(&buf[2 + um_len..2 + um_len + 8]);
        let value = buf.slice(2 + um_len + 8..);
        Ok(Self {
            meta,
            user_meta,
            version,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_ordering() {
        // Same user key: higher version sorts first.
        let newer = encode_internal(b"k", 20);
        let older = encode_internal(b"k", 10);
        assert!(newer < older);

        // Different user keys: user key ascending dominates.
        let a = encode_internal(b"a", 1);
        let b = encode_internal(b"b", u64::MAX);
        assert!(a < b);
    }

    #[test]
    fn test_internal_roundtrip() {
        let ikey = encode_internal(b"user-key", 42);
        let (uk, version) = split_internal(&ikey);
        assert_eq!(uk, b"user-key");
        assert_eq!(version, 42);
    }

    #[test]
    fn test_value_roundtrip() {
        let v = Value::new(7, Bytes::from_static(b"payload"))
            .with_user_meta(Bytes::from_static(b"\x01"));
        let decoded = Value::decode(v.encode()).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(v.encode().len(), v.encoded_size());
    }

    #[test]
    fn test_tombstone() {
        let t = Value::tombstone(3);
        assert!(t.is_deleted());
        let decoded = Value::decode(t.encode()).unwrap();
        assert!(decoded.is_deleted());
        assert_eq!(decoded.version, 3);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(Value::decode(Bytes::from_static(b"\x00\x05")).is_err());
    }
}
