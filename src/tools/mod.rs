//! Small helpers shared across the proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod digest;
pub mod sysinfo;

/// Process-wide run flag shared by the service loops and background workers.
#[derive(Clone, Default)]
pub struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Current unix time in seconds.
pub fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn running_flag_toggles() {
        let flag = RunningFlag::new();
        assert!(flag.is_running());
        let clone = flag.clone();
        clone.shutdown();
        assert!(!flag.is_running());
    }
}
