//! Extended-attribute blob codec.
//!
//! A value with the XATTR datatype bit starts with a blob:
//!
//! ```text
//! u32 BE body_len
//!   u32 BE pair_len, key bytes, 0x00, value bytes, 0x00   (repeated)
//! <document body follows the blob>
//! ```
//!
//! `pair_len` counts the key, the value and both NUL terminators. Keys
//! beginning with `_` are system xattrs and survive deletion; everything
//! else is user data and is pruned with the document body.

use bytes::{BufMut, Bytes, BytesMut};

pub const SYSTEM_PREFIX: u8 = b'_';

#[inline]
pub fn is_system_key(key: &[u8]) -> bool {
    key.first() == Some(&SYSTEM_PREFIX)
}

/// A parsed xattr section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob {
    entries: Vec<(Bytes, Bytes)>,
}

impl Blob {
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| {
                    (
                        Bytes::copy_from_slice(k.as_ref()),
                        Bytes::copy_from_slice(v.as_ref()),
                    )
                })
                .collect(),
        }
    }

    /// Parse the xattr section off the front of a value. Returns the blob
    /// and the number of bytes it occupied, or None if the section is
    /// malformed.
    pub fn parse(value: &[u8]) -> Option<(Self, usize)> {
        if value.len() < 4 {
            return None;
        }
        let body_len = u32::from_be_bytes(value[..4].try_into().ok()?) as usize;
        let total = 4 + body_len;
        if value.len() < total {
            return None;
        }

        let mut entries = Vec::new();
        let mut pos = 4;
        while pos < total {
            if total - pos < 4 {
                return None;
            }
            let pair_len = u32::from_be_bytes(value[pos..pos + 4].try_into().ok()?) as usize;
            pos += 4;
            if pair_len < 2 || total - pos < pair_len {
                return None;
            }
            let pair = &value[pos..pos + pair_len];
            let key_end = pair.iter().position(|&b| b == 0)?;
            // pair must end with the value NUL
            if pair[pair_len - 1] != 0 {
                return None;
            }
            let key = Bytes::copy_from_slice(&pair[..key_end]);
            let val = Bytes::copy_from_slice(&pair[key_end + 1..pair_len - 1]);
            entries.push((key, val));
            pos += pair_len;
        }

        Some((Self { entries }, total))
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything but the system xattrs.
    pub fn keep_system(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| is_system_key(k))
                .cloned()
                .collect(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let body_len: usize = self
            .entries
            .iter()
            .map(|(k, v)| 4 + k.len() + v.len() + 2)
            .sum();
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        for (k, v) in &self.entries {
            buf.put_u32((k.len() + v.len() + 2) as u32);
            buf.put_slice(k);
            buf.put_u8(0);
            buf.put_slice(v);
            buf.put_u8(0);
        }
        buf.freeze()
    }
}

/// Split an XATTR-flagged value into its blob and document body.
pub fn split(value: &[u8]) -> Option<(Blob, &[u8])> {
    let (blob, consumed) = Blob::parse(value)?;
    Some((blob, &value[consumed..]))
}

/// Build a value holding only the system xattrs of `value`, or None when
/// there are none (the tombstone carries no value at all).
pub fn system_only(value: &[u8]) -> Option<Bytes> {
    let (blob, _) = Blob::parse(value)?;
    let system = blob.keep_system();
    if system.is_empty() {
        None
    } else {
        Some(system.encode())
    }
}
