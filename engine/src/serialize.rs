//! The opaque `serialize`/`deserialize` boundary (§1, §3): the engine
//! itself never looks inside a value's bytes, but callers need *some*
//! concrete codec to turn typed values into the `Vec<u8>` the `Storage`
//! trait moves around. This module supplies the one the rest of the
//! crate's CLI and tests use, built on `bincode` like the rest of the
//! on-disk encoding in `storage::file`.
//!
//! The only contract the engine relies on is size-preservation: encoding
//! then decoding a value must reproduce it exactly (P8), and the engine's
//! [`crate::limits::MAX_VALUE_BYTES`] check is applied to the *encoded*
//! bytes, not the logical value.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CResult, Error};

/// Encodes `value` to bytes using the crate's chosen wire format.
pub fn serialize<T: Serialize>(value: &T) -> CResult<Vec<u8>> {
    bincode::serialize(value).map_err(|err| Error::Internal(err.to_string()))
}

/// Decodes bytes previously produced by [`serialize`]. Failures are
/// wrapped as [`Error::DeserializationFailure`] rather than propagated
/// verbatim, since the original `bincode::Error` carries no information
/// about which stored key produced it.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> CResult<T> {
    bincode::deserialize(bytes).map_err(|err| Error::DeserializationFailure(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i64,
        y: i64,
    }

    #[test]
    fn round_trips() -> CResult<()> {
        let original = Point { x: 3, y: -7 };
        let bytes = serialize(&original)?;
        let decoded: Point = deserialize(&bytes)?;
        assert_eq!(decoded, original);
        Ok(())
    }

    #[test]
    fn corrupt_bytes_yield_deserialization_failure() {
        let err = deserialize::<Point>(&[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, Error::DeserializationFailure(_)));
    }
}
