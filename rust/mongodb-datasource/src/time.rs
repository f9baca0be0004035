//! Time macros used when rewriting pipeline placeholders.
//!
//! Every function here is pure: the same inputs always produce the same text.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

/// Hex width of a MongoDB ObjectID.
pub const OBJECT_ID_HEX_LEN: usize = 24;

/// Hex width of the timestamp prefix embedded in an ObjectID.
const OBJECT_ID_TS_HEX_LEN: usize = 8;

/// Dashboard time range in epoch milliseconds. Hosts send the bounds either as
/// numbers or as decimal strings.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeRange {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub from: i64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub to: i64,
}

impl TimeRange {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }
}

/// Padding used after the timestamp prefix of an ObjectID bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OidPadding {
    /// Smallest id for the second; used for the lower bound.
    Lower,
    /// Largest id for the second; used for the upper bound.
    Upper,
}

impl OidPadding {
    fn fill(self) -> char {
        match self {
            OidPadding::Lower => '0',
            OidPadding::Upper => 'f',
        }
    }
}

/// Renders `{"$date":{"$numberLong":"<ms>"}}` for an epoch-millisecond instant.
pub fn date_to_extended_json(ms: i64) -> String {
    serde_json::json!({ "$date": { "$numberLong": ms.to_string() } }).to_string()
}

/// Encodes the whole seconds of `ms` as the 8-digit timestamp prefix of an
/// ObjectID and pads it to 24 hex digits.
///
/// Returns an empty string when the seconds value does not fit the unsigned
/// 32-bit ObjectID timestamp.
pub fn epoch_ms_to_object_id_hex(ms: i64, padding: OidPadding) -> String {
    let seconds = ms.div_euclid(1000);
    if !(0..=i64::from(u32::MAX)).contains(&seconds) {
        return String::new();
    }

    let mut hex = format!("{seconds:0width$x}", width = OBJECT_ID_TS_HEX_LEN);
    let fill = padding.fill();
    while hex.len() < OBJECT_ID_HEX_LEN {
        hex.push(fill);
    }
    hex
}

/// Number of `interval_ms` steps needed to get from `from_ms` to at least
/// `to_ms`. Empty or inverted ranges and non-positive intervals yield zero.
pub fn bucket_count(from_ms: i64, to_ms: i64, interval_ms: i64) -> i64 {
    if from_ms >= to_ms || interval_ms <= 0 {
        return 0;
    }

    let span = i128::from(to_ms) - i128::from(from_ms);
    let interval = i128::from(interval_ms);
    let buckets = (span + interval - 1) / interval;
    i64::try_from(buckets).unwrap_or(i64::MAX)
}
