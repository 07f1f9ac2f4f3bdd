//! Crate-wide error type. Mirrors the error kinds the operator surface
//! must distinguish, plus the handful of IO/internal kinds a backing
//! store can raise.

use std::fmt::{self, Display};

/// Convenience alias used throughout the crate, as `kv::error::CResult`
/// is used throughout the teacher crate.
pub type CResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Key byte length exceeded [`crate::limits::MAX_KEY_BYTES`].
    KeyTooLarge { len: usize },
    /// Value byte length exceeded [`crate::limits::MAX_VALUE_BYTES`].
    ValueTooLarge { len: usize },
    /// A single batched get/put/delete touched more than
    /// [`crate::limits::MAX_KEYS_PER_CALL`] keys.
    TooManyKeys { count: usize },
    /// `put` with a map of more than [`crate::limits::MAX_KEYS_PER_CALL`] pairs.
    TooManyPairs { count: usize },
    /// A transaction attempted to write more than
    /// [`crate::limits::MAX_WRITE_SET`] distinct keys.
    TooManyWrites { count: usize },
    /// A key argument was required but missing.
    UndefinedKey { op: &'static str },
    /// `put(k, ..)` was called without a value.
    UndefinedValue { op: &'static str },
    /// `limit <= 0`, or both `start` and `start_after` were set.
    InvalidListOptions(String),
    /// `set_alarm` was called on an object with no alarm handler.
    NoAlarmHandler,
    /// `set_alarm` was called with a non-positive scheduled time.
    AlarmTimeNonPositive { millis: i64 },
    /// An operation was attempted on a transaction after it committed.
    MisuseAfterCommit,
    /// An operation was attempted on a transaction after it rolled back.
    MisuseAfterRollback,
    /// `deserialize` failed on a value read back from storage.
    DeserializationFailure(String),
    /// An operation has no meaning inside a transaction (currently only
    /// `deleteAll`, per §4.4).
    UnsupportedInTransaction { op: &'static str },
    /// The backing store rejected or failed an operation.
    Internal(String),
    /// Propagated verbatim from the backing store's filesystem access.
    Io(std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KeyTooLarge { len } => {
                write!(f, "key too large: {len} bytes exceeds the 2048 byte limit")
            }
            Error::ValueTooLarge { len } => {
                write!(f, "value too large: {len} bytes exceeds the 128 KiB + 32 byte limit")
            }
            Error::TooManyKeys { count } => {
                write!(f, "too many keys: {count} exceeds the 128 key limit for a single call")
            }
            Error::TooManyPairs { count } => {
                write!(f, "too many pairs: {count} exceeds the 128 pair limit for put()")
            }
            Error::TooManyWrites { count } => {
                write!(f, "too many writes: transaction wrote {count} distinct keys, limit is 128")
            }
            Error::UndefinedKey { op } => write!(f, "{op}: key is required"),
            Error::UndefinedValue { op } => write!(f, "{op}: value is required"),
            Error::InvalidListOptions(msg) => write!(f, "invalid list options: {msg}"),
            Error::NoAlarmHandler => {
                write!(f, "set_alarm called on an object with no alarm handler")
            }
            Error::AlarmTimeNonPositive { millis } => {
                write!(f, "alarm scheduled time must be positive, got {millis}")
            }
            Error::MisuseAfterCommit => {
                write!(f, "transaction handle used outside its closure: it already committed")
            }
            Error::MisuseAfterRollback => {
                write!(f, "transaction handle used outside its closure: it already rolled back")
            }
            Error::DeserializationFailure(cause) => write!(f, "deserialization failed: {cause}"),
            Error::UnsupportedInTransaction { op } => {
                write!(f, "{op} is not supported inside a transaction")
            }
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
