use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Admits one holder at a time; clones share the same slot.
/// Used to keep scan cycles from overlapping.
pub struct SingleFlight {
    slot: Arc<Mutex<()>>,
}

/// Held for the duration of one flight. Dropping it frees the slot.
pub struct FlightGuard {
    _guard: OwnedMutexGuard<()>,
}

impl SingleFlight {
    pub fn new() -> Self {
        SingleFlight { slot: Arc::new(Mutex::new(())) }
    }

    /// Waits for the current flight, if any, to land.
    pub async fn acquire(&self) -> FlightGuard {
        FlightGuard { _guard: self.slot.clone().lock_owned().await }
    }

    /// Returns `None` while another flight is in progress.
    pub fn try_acquire(&self) -> Option<FlightGuard> {
        self.slot.clone().try_lock_owned().ok().map(|g| FlightGuard { _guard: g })
    }

    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SingleFlight {
    fn clone(&self) -> Self {
        SingleFlight { slot: self.slot.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let flight = SingleFlight::new();
        let other = flight.clone();
        let guard = flight.try_acquire().expect("first flight");
        assert!(other.try_acquire().is_none());
        assert!(other.is_busy());
        drop(guard);
        assert!(other.try_acquire().is_some());
    }

    #[tokio::test]
    async fn acquire_serializes_holders() {
        let flight = SingleFlight::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let flight = flight.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _g = flight.acquire().await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
