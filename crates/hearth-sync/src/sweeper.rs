//! Background expiry sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hearth_core::ExpiringCache;

/// Periodically drops expired cache entries.
///
/// Expiry is otherwise lazy, so without a sweep an entry that is never read
/// again stays resident until it is evicted.
pub struct CacheSweeper {
    handle: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl CacheSweeper {
    /// Start sweeping `cache` every `interval`. Must be called within a Tokio runtime.
    pub fn start<V>(cache: Arc<ExpiringCache<V>>, interval: Duration) -> Self
    where
        V: Clone + Send + 'static,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let stop_flag_clone = stop_flag.clone();
        let wake_clone = wake.clone();

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "cache sweeper started");

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake_clone.notified() => {}
                }

                if stop_flag_clone.load(Ordering::SeqCst) {
                    info!("cache sweeper stopping");
                    break;
                }

                let removed = cache.purge_expired();
                debug!(removed, remaining = cache.len(), "expired cache entries swept");
            }
        });

        Self {
            handle: Some(handle),
            stop_flag,
            wake,
        }
    }

    /// Signal the sweeper to stop.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Stop the sweeper and wait for it to finish.
    pub async fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "cache sweeper panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{CacheConfig, CacheKey};

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_expired_entries() {
        let cache = Arc::new(ExpiringCache::<u32>::new(CacheConfig::default()));
        cache.set(
            CacheKey::new("fam1", "chores").unwrap(),
            1,
            Some(Duration::from_secs(5)),
        );
        cache.set(
            CacheKey::new("fam1", "members").unwrap(),
            2,
            Some(Duration::from_secs(60)),
        );

        let sweeper = CacheSweeper::start(cache.clone(), Duration::from_secs(10));
        settle().await;
        assert!(sweeper.is_running());

        tokio::time::advance(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 1);

        sweeper.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_wait_for_tick() {
        let cache = Arc::new(ExpiringCache::<u32>::new(CacheConfig::default()));
        let sweeper = CacheSweeper::start(cache, Duration::from_secs(3600));
        settle().await;

        sweeper.join().await;
    }
}
