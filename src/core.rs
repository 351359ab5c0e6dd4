use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// A type-erased, serializable value.
///
/// Task inputs, task outputs and output stamps are all kept in this form, so
/// the store can hold tasks of any type side by side and compare them without
/// knowing their concrete Rust types.
pub type Value = ciborium::Value;

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `kiln`, this serves two primary purposes:
/// 1. It is the digest part of every [`TaskKey`](crate::TaskKey), computed
///    over the canonical encoding of the task's input.
/// 2. It is the stamp value produced by the hashing resource stampers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// The first eight hex digits, enough to tell keys apart in logs.
    pub(crate) fn to_short_hex(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Converts a typed value into its type-erased form.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Value, Error> {
    Value::serialized(value).map_err(|e| Error::Codec(e.to_string()))
}

/// Converts a type-erased value back into a typed one.
pub fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, Error> {
    value
        .deserialized()
        .map_err(|e| Error::Codec(e.to_string()))
}

/// Serializes a value to CBOR bytes.
pub(crate) fn to_bytes(value: &Value) -> Result<Vec<u8>, Error> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(buffer)
}

/// Content digest of a value, stable across processes.
pub(crate) fn digest(value: &Value) -> Result<Hash32, Error> {
    Ok(Hash32::hash(to_bytes(value)?))
}

/// The cached result of a task.
///
/// A task may legitimately produce `()` or `None`, which encode to a null
/// value. Wrapping the value keeps "there is no cached output" (`None` at the
/// call site) apart from "the cached output is null" (`Some(Output(Null))`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Output(pub(crate) Value);

impl Output {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Decodes the output into the type produced by the task definition.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        decode(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        let a = digest(&encode(&(1u32, "a")).unwrap()).unwrap();
        let b = digest(&encode(&(1u32, "a")).unwrap()).unwrap();
        let c = digest(&encode(&(2u32, "a")).unwrap()).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_null_output_is_present() {
        let output = Output::new(encode(&()).unwrap());
        assert!(output.is_null());

        let cached: Option<Output> = Some(output);
        assert!(cached.is_some());
    }

    #[test]
    fn test_hex() {
        let hash = Hash32::from([0xab; 32]);
        assert_eq!(hash.to_hex().len(), 64);
        assert!(hash.to_hex().starts_with("abab"));
        assert_eq!(hash.to_short_hex(), "abababab");
    }
}
