//! Pointer liveness bitmaps.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8` (least significant
//! first). The textual record is `"<nbit>:<hex bytes>"`, e.g. `"3:05"`.
//! Bits past `nbit` in the last byte must be clear so every bitmap has
//! exactly one encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{ObjlensError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LivenessBitmap {
    nbit: usize,
    bytes: Vec<u8>,
}

fn malformed(msg: impl Into<String>) -> ObjlensError {
    ObjlensError::MalformedBitmap(msg.into())
}

impl LivenessBitmap {
    /// Bitmap of `nbit` bits packed in `bytes`.
    pub fn new(nbit: usize, bytes: Vec<u8>) -> Result<Self> {
        let want = nbit.div_ceil(8);
        if bytes.len() != want {
            return Err(malformed(format!(
                "{} bits need {} bytes, got {}",
                nbit,
                want,
                bytes.len()
            )));
        }
        if nbit % 8 != 0 {
            let spare = bytes[want - 1] >> (nbit % 8);
            if spare != 0 {
                return Err(malformed(format!("bits set past bit {}", nbit)));
            }
        }
        Ok(Self { nbit, bytes })
    }

    pub fn len(&self) -> usize {
        self.nbit
    }

    pub fn is_empty(&self) -> bool {
        self.nbit == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether slot `n` holds a live pointer.
    pub fn bit(&self, n: usize) -> Result<bool> {
        if n >= self.nbit {
            return Err(ObjlensError::IndexOutOfRange {
                index: n,
                len: self.nbit,
            });
        }
        Ok(self.bytes[n / 8] >> (n % 8) & 1 != 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.nbit).map(move |n| self.bytes[n / 8] >> (n % 8) & 1 != 0)
    }

    pub fn count_live(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }
}

impl FromStr for LivenessBitmap {
    type Err = ObjlensError;

    fn from_str(s: &str) -> Result<Self> {
        let (count, packed) = s
            .split_once(':')
            .ok_or_else(|| malformed(format!("missing ':' in {:?}", s)))?;
        let nbit: usize = count
            .parse()
            .map_err(|_| malformed(format!("bad bit count {:?}", count)))?;
        if packed.bytes().any(|c| c.is_ascii_uppercase()) {
            return Err(malformed("hex digits must be lowercase"));
        }
        let bytes = hex::decode(packed).map_err(|e| malformed(e.to_string()))?;
        Self::new(nbit, bytes)
    }
}

impl fmt::Display for LivenessBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.nbit, hex::encode(&self.bytes))
    }
}

impl Serialize for LivenessBitmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
