//! Real-time sources. The simulated clock never reads the OS directly;
//! it is always handed a reading from a `WallClock`.

use crate::types::Millis;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

pub trait WallClock: Send + Sync {
    fn now_ms(&self) -> Millis;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_ms(&self) -> Millis {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Settable clock shared between a test and the session it drives.
#[derive(Debug, Clone, Default)]
pub struct ManualWallClock {
    now: Arc<AtomicI64>,
}

impl ManualWallClock {
    pub fn new(start_ms: Millis) -> Self {
        Self { now: Arc::new(AtomicI64::new(start_ms)) }
    }

    pub fn advance(&self, delta_ms: Millis) {
        self.now.fetch_add(delta_ms, Ordering::AcqRel);
    }

    pub fn set(&self, ms: Millis) {
        self.now.store(ms, Ordering::Release);
    }
}

impl WallClock for ManualWallClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::Acquire)
    }
}
