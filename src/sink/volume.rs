//! Fire-and-forget volume updates
//!
//! Volume changes are handed to a worker thread over an unbounded channel so
//! the caller never waits on a slow controller. Bursts collapse to the most
//! recent level.

use crossbeam_channel::{unbounded, Sender};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

use crate::error::SinkError;

/// Background applier of volume levels
pub struct VolumeDispatcher {
    tx: Option<Sender<u8>>,
    current: Arc<AtomicU8>,
}

impl VolumeDispatcher {
    /// Spawn the worker; `apply` runs on it for every coalesced level
    pub fn new<F>(initial: u8, apply: F) -> Self
    where
        F: Fn(u8) -> Result<(), SinkError> + Send + 'static,
    {
        let (tx, rx) = unbounded::<u8>();
        let current = Arc::new(AtomicU8::new(initial));

        let spawned = thread::Builder::new()
            .name("volume".to_string())
            .spawn(move || {
                while let Ok(mut level) = rx.recv() {
                    for newer in rx.try_iter() {
                        level = newer;
                    }
                    match apply(level) {
                        Ok(()) => debug!(level, "Volume applied"),
                        Err(e) => error!("Failed to set volume to {}: {}", level, e),
                    }
                }
            });

        let tx = match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                error!("Failed to spawn volume worker: {}", e);
                None
            }
        };

        Self { tx, current }
    }

    /// Queue `level` and return immediately
    pub fn set(&self, level: u8) {
        self.current.store(level, Ordering::Relaxed);
        if let Some(tx) = &self.tx {
            let _ = tx.send(level);
        }
    }

    pub fn current(&self) -> u8 {
        self.current.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    #[test]
    fn test_set_does_not_wait_for_apply() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let dispatcher = VolumeDispatcher::new(75, move |level| {
            thread::sleep(Duration::from_millis(100));
            sink.lock().push(level);
            Ok(())
        });

        let start = Instant::now();
        dispatcher.set(10);
        dispatcher.set(20);
        dispatcher.set(30);
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(dispatcher.current(), 30);

        let deadline = Instant::now() + Duration::from_secs(2);
        while applied.lock().last() != Some(&30) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(applied.lock().last(), Some(&30));
    }

    #[test]
    fn test_apply_errors_are_swallowed() {
        let dispatcher = VolumeDispatcher::new(0, |_| Err(SinkError::Controller("down".into())));
        dispatcher.set(50);
        assert_eq!(dispatcher.current(), 50);
    }
}
