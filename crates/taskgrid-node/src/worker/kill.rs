use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const ALIVE: u8 = 0;
const KILLING: u8 = 1;
const KILLING_FORCED: u8 = 2;

/// How a termination request should be carried out.
/// A graceful kill lets the current task finish; a forced kill does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    Graceful,
    Forced,
}

/// The termination request flag for one worker.
///
/// This is the only worker state shared across execution contexts: kill
/// requests may arrive off the scheduling loop, while every other handle
/// field is mutated by the loop alone. The flag transitions from alive to
/// killing exactly once via compare-and-swap; once a reader observes
/// `is_killed()`, the acquire/release ordering guarantees that all state
/// written before the kill request is visible to it. The flag never
/// reverts.
#[derive(Debug, Clone, Default)]
pub struct KillFlag {
    state: Arc<AtomicU8>,
}

impl KillFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests termination of the worker.
    /// Returns `true` for the one caller that flipped the flag; concurrent
    /// and repeated requests are no-ops and return `false`. The mode is
    /// recorded together with the flip, so later callers cannot change it.
    pub fn request(&self, force: bool) -> bool {
        let target = if force { KILLING_FORCED } else { KILLING };
        self.state
            .compare_exchange(ALIVE, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether termination has been requested.
    /// The read may be one step stale: a `false` result does not mean the
    /// worker will remain alive.
    pub fn is_killed(&self) -> bool {
        self.state.load(Ordering::Acquire) != ALIVE
    }

    pub fn mode(&self) -> Option<KillMode> {
        match self.state.load(Ordering::Acquire) {
            KILLING => Some(KillMode::Graceful),
            KILLING_FORCED => Some(KillMode::Forced),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_wins() {
        let flag = KillFlag::new();
        assert!(!flag.is_killed());
        assert_eq!(flag.mode(), None);
        assert!(flag.request(false));
        assert!(flag.is_killed());
        assert_eq!(flag.mode(), Some(KillMode::Graceful));
        // A later forced request cannot change the recorded mode.
        assert!(!flag.request(true));
        assert_eq!(flag.mode(), Some(KillMode::Graceful));
    }

    #[tokio::test]
    async fn test_concurrent_requests_have_one_winner() {
        let flag = KillFlag::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let flag = flag.clone();
            handles.push(tokio::spawn(async move { flag.request(i % 2 == 0) }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(flag.is_killed());
        assert!(flag.mode().is_some());
    }
}
