use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Milliseconds between the Unix epoch and the id epoch (2019-03-06).
pub const EPOCH_MS: u64 = 1_551_864_242_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const TIME_SHIFT: u32 = NODE_BITS + SEQUENCE_BITS;
const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIME: u64 = (1 << 41) - 1;

/// A time-sortable post identifier.
///
/// Layout, most significant bit first: one unused bit, 41 bits of
/// milliseconds since [`EPOCH_MS`], 10 bits of node id and 12 bits of
/// sequence. Ids always fit in an `i64`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct PostId(u64);

impl PostId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Build an id from its components. `unix_ms` is clamped to the
    /// representable range.
    pub fn from_parts(unix_ms: u64, node: u16, sequence: u16) -> Self {
        let since_epoch = unix_ms.saturating_sub(EPOCH_MS).min(MAX_TIME);
        Self(
            (since_epoch << TIME_SHIFT)
                | (u64::from(node & MAX_NODE) << SEQUENCE_BITS)
                | u64::from(sequence & MAX_SEQUENCE),
        )
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The id as stored in SQLite, which only has signed integers.
    pub fn as_i64(self) -> i64 {
        (self.0 & i64::MAX as u64) as i64
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value as u64 & i64::MAX as u64)
    }

    /// Creation time embedded in the id, as Unix milliseconds.
    pub fn timestamp_ms(self) -> u64 {
        (self.0 >> TIME_SHIFT) + EPOCH_MS
    }

    pub fn node(self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & u64::from(MAX_NODE)) as u16
    }

    pub fn sequence(self) -> u16 {
        (self.0 & u64::from(MAX_SEQUENCE)) as u16
    }
}

impl std::fmt::Display for PostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PostId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(Self)
    }
}

/// Sort newest first by the embedded creation time.
///
/// Ties (same millisecond) fall back to the full id so the order is
/// deterministic.
pub fn sort_newest_first(ids: &mut [PostId]) {
    ids.sort_unstable_by(|a, b| {
        b.timestamp_ms()
            .cmp(&a.timestamp_ms())
            .then_with(|| b.cmp(a))
    });
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_ms: u64,
    sequence: u16,
}

/// Hands out strictly increasing ids for one node.
#[derive(Debug)]
pub struct PostIdGenerator {
    node: u16,
    state: Mutex<GeneratorState>,
}

impl Default for PostIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl PostIdGenerator {
    pub fn new(node: u16) -> Self {
        Self {
            node: node & MAX_NODE,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    pub fn generate(&self) -> PostId {
        self.generate_with(now_ms)
    }

    fn generate_with(&self, mut clock: impl FnMut() -> u64) -> PostId {
        let mut state = self.state.lock();
        // A clock that steps backwards keeps reusing the last timestamp.
        let mut now = clock().max(state.last_ms);

        if now == state.last_ms {
            if state.sequence == MAX_SEQUENCE {
                while now <= state.last_ms {
                    std::thread::yield_now();
                    now = clock().max(state.last_ms);
                }
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;
        PostId::from_parts(now, self.node, state.sequence)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MS)
}
