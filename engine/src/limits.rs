//! Numeric limits enforced before any call touches the backing store (§6).

/// I1: maximum key byte length.
pub const MAX_KEY_BYTES: usize = 2048;

/// I1: maximum stored value byte length (128 KiB logical cap + 32 bytes of
/// envelope headroom).
pub const MAX_VALUE_BYTES: usize = 128 * 1024 + 32;

/// I2: maximum keys touched by a single batched get/put/delete.
pub const MAX_KEYS_PER_CALL: usize = 128;

/// I2 / I4: maximum distinct keys a transaction may write, and the
/// capacity of the write-set history ring (§4.7).
pub const MAX_WRITE_SET: usize = 128;

/// §4.7: write-set history retention.
pub const WRITE_SET_HISTORY_CAPACITY: u64 = 16;

/// §6: reserved key used to persist an object's alarm in its own backing
/// store, with the scheduled time carried in the entry's metadata.
pub const ALARM_RESERVED_KEY: &str = "__MINIFLARE_ALARMS__";

/// §4.7: the scheduler's recurring re-scan interval.
pub const ALARM_POLL_INTERVAL_MS: i64 = 30_000;

/// §4.7: `setupAlarms` arms an individual timer for any alarm due within
/// this many milliseconds of "now".
pub const ALARM_NEAR_FUTURE_MS: i64 = 30_000;

/// §4.7: `setAlarm` (re-)arms the individual timer when the new time is
/// within this many milliseconds of "now".
pub const ALARM_ARM_WINDOW_MS: i64 = 31_000;
