//! Correlation ids: `epoch_millis * 100_000 + r` with `r` uniform in
//! `[0, 100_000)`, sent as a decimal string.

use std::time::{SystemTime, UNIX_EPOCH};

use frames::Id;
use rand::Rng;

const SUFFIX_SPAN: u64 = 100_000;

#[must_use]
pub fn next_id() -> Id {
    let millis = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis());
    let suffix = rand::rng().random_range(0..SUFFIX_SPAN);
    Id::Str((millis * u128::from(SUFFIX_SPAN) + u128::from(suffix)).to_string())
}
