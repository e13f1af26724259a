use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Opaque handle for one registered operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationToken(u32);

impl OperationToken {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Issues tokens made of random high bits and a rolling low byte, so two
/// tokens issued close together never collide and stale tokens from an
/// earlier run are unlikely to match.
#[derive(Debug, Default)]
pub struct TokenGenerator {
    counter: AtomicU32,
}

impl TokenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_token(&self) -> OperationToken {
        let high = rand::random::<u32>() & 0x7fff_ff00;
        let low = self.counter.fetch_add(1, Ordering::Relaxed) & 0xff;
        OperationToken(high | low)
    }
}
