//! LRU-bounded cache of per-characteristic rolling windows, with lazy
//! database backfill on first access (§4.2).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

use crate::rules::{NelsonRuleLibrary, RuleResult};
use crate::stats::ZoneBoundaries;
use crate::window::rolling::{RollingWindow, WindowSample};

/// One historical subgroup as loaded from durable storage for backfill.
#[derive(Debug, Clone)]
pub struct LoadedSample {
    pub sample_id: i64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub value: f64,
    pub range: Option<f64>,
    /// True when the sample has been excluded from future limit
    /// recomputation. Per the resolved Open Question in `SPEC_FULL.md` §9,
    /// excluded samples are also skipped when repopulating a window after a
    /// cache miss, not only when recomputing limits.
    pub is_excluded: bool,
}

/// What a [`WindowManager`] needs from the persistence layer: the newest `W`
/// samples for a characteristic (oldest first) and its currently stored zone
/// boundaries.
#[async_trait]
pub trait WindowRepository: Send + Sync {
    async fn load_recent_samples(
        &self,
        characteristic_id: i64,
        limit: usize,
    ) -> crate::Result<Vec<LoadedSample>>;

    async fn load_boundaries(
        &self,
        characteristic_id: i64,
    ) -> crate::Result<Option<ZoneBoundaries>>;
}

/// LRU cache mapping `char_id -> RollingWindow`, sized to a maximum number of
/// cached characteristics (default 1000, §4.2). Each window is behind its own
/// `Mutex` so that independent characteristics can update in parallel while
/// writes to one window never interleave (§5).
pub struct WindowManager<R: WindowRepository> {
    cache: Mutex<LruCache<i64, Arc<Mutex<RollingWindow>>>>,
    window_size: usize,
    repository: Arc<R>,
}

impl<R: WindowRepository> WindowManager<R> {
    pub fn new(max_cached_characteristics: usize, window_size: usize, repository: Arc<R>) -> Self {
        let capacity = NonZeroUsize::new(max_cached_characteristics.max(1)).unwrap();
        WindowManager {
            cache: Mutex::new(LruCache::new(capacity)),
            window_size: window_size.max(1),
            repository,
        }
    }

    /// Returns the window for `char_id`, loading it from the repository on a
    /// cache miss and touching its LRU order on a hit.
    pub async fn get(&self, characteristic_id: i64) -> crate::Result<Arc<Mutex<RollingWindow>>> {
        // Short critical section: only the map lookup/insert/evict, never
        // the (potentially slow) backfill itself.
        let existing = {
            let mut cache = self.cache.lock().await;
            cache.get(&characteristic_id).cloned()
        };
        if let Some(window) = existing {
            return Ok(window);
        }

        let window = Arc::new(Mutex::new(RollingWindow::new(self.window_size)));
        {
            let mut cache = self.cache.lock().await;
            // Another task may have raced us to load this characteristic;
            // prefer whatever is already cached to avoid duplicate backfill.
            if let Some(existing) = cache.get(&characteristic_id).cloned() {
                return Ok(existing);
            }
            cache.put(characteristic_id, window.clone());
        }

        self.backfill(characteristic_id, &window).await?;
        Ok(window)
    }

    async fn backfill(
        &self,
        characteristic_id: i64,
        window: &Arc<Mutex<RollingWindow>>,
    ) -> crate::Result<()> {
        let boundaries = self.repository.load_boundaries(characteristic_id).await?;
        let Some(boundaries) = boundaries else {
            // No limits yet (brand-new characteristic): leave the window
            // empty rather than classifying samples under nonexistent
            // boundaries.
            return Ok(());
        };
        let samples = self
            .repository
            .load_recent_samples(characteristic_id, self.window_size)
            .await?;

        let mut guard = window.lock().await;
        for sample in samples.into_iter().filter(|s| !s.is_excluded) {
            guard.append(
                sample.sample_id,
                sample.timestamp,
                sample.value,
                sample.range,
                &boundaries,
            );
        }
        Ok(())
    }

    /// Classifies and appends a newly persisted sample to its
    /// characteristic's window and evaluates the rule library against the
    /// resulting window, all under one held guard (§4.2 `add_sample`, §4.6,
    /// §5: "per-`char_id` exclusive lock held across a full engine cycle").
    ///
    /// Appending and evaluating under a single acquisition (rather than one
    /// lock for the append and a second, later one for rule evaluation)
    /// closes the window where two concurrent cycles for the same
    /// characteristic could interleave as A-append, B-append, A-evaluate —
    /// which would have A firing rules against a window whose newest entry
    /// is B's sample instead of its own.
    pub async fn add_sample_and_evaluate(
        &self,
        characteristic_id: i64,
        sample_id: i64,
        timestamp: chrono::DateTime<chrono::Utc>,
        value: f64,
        range: Option<f64>,
        boundaries: &ZoneBoundaries,
        rule_library: &NelsonRuleLibrary,
        enabled_rules: &HashSet<u8>,
    ) -> crate::Result<(WindowSample, Vec<RuleResult>)> {
        let window = self.get(characteristic_id).await?;
        let mut guard = window.lock().await;
        let window_sample = guard.append(sample_id, timestamp, value, range, boundaries);
        let fired = rule_library.check_all(&guard, enabled_rules);
        Ok((window_sample, fired))
    }

    /// Removes `char_id` from the cache. Used after boundary recomputation so
    /// the next access backfills under the new limits.
    pub async fn invalidate(&self, characteristic_id: i64) {
        let mut cache = self.cache.lock().await;
        cache.pop(&characteristic_id);
    }

    pub async fn size(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn cached_ids(&self) -> Vec<i64> {
        self.cache.lock().await.iter().map(|(k, _)| *k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRepo {
        boundaries: ZoneBoundaries,
        samples: Vec<LoadedSample>,
        load_calls: AtomicUsize,
    }

    #[async_trait]
    impl WindowRepository for FakeRepo {
        async fn load_recent_samples(
            &self,
            _characteristic_id: i64,
            _limit: usize,
        ) -> crate::Result<Vec<LoadedSample>> {
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.samples.clone())
        }

        async fn load_boundaries(
            &self,
            _characteristic_id: i64,
        ) -> crate::Result<Option<ZoneBoundaries>> {
            Ok(Some(self.boundaries))
        }
    }

    fn sample(id: i64, value: f64) -> LoadedSample {
        LoadedSample {
            sample_id: id,
            timestamp: chrono::Utc::now(),
            value,
            range: None,
            is_excluded: false,
        }
    }

    #[tokio::test]
    async fn cache_miss_backfills_from_repository() {
        let repo = Arc::new(FakeRepo {
            boundaries: ZoneBoundaries::new(100.0, 2.0).unwrap(),
            samples: vec![sample(1, 100.0), sample(2, 101.0)],
            load_calls: AtomicUsize::new(0),
        });
        let manager = WindowManager::new(10, 25, repo.clone());
        let window = manager.get(42).await.unwrap();
        assert_eq!(window.lock().await.len(), 2);
        assert_eq!(repo.load_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_hit_does_not_reload() {
        let repo = Arc::new(FakeRepo {
            boundaries: ZoneBoundaries::new(100.0, 2.0).unwrap(),
            samples: vec![sample(1, 100.0)],
            load_calls: AtomicUsize::new(0),
        });
        let manager = WindowManager::new(10, 25, repo.clone());
        manager.get(42).await.unwrap();
        manager.get(42).await.unwrap();
        assert_eq!(repo.load_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn excluded_samples_are_skipped_on_backfill() {
        let mut excluded = sample(1, 999.0);
        excluded.is_excluded = true;
        let repo = Arc::new(FakeRepo {
            boundaries: ZoneBoundaries::new(100.0, 2.0).unwrap(),
            samples: vec![excluded, sample(2, 100.0)],
            load_calls: AtomicUsize::new(0),
        });
        let manager = WindowManager::new(10, 25, repo);
        let window = manager.get(1).await.unwrap();
        let guard = window.lock().await;
        assert_eq!(guard.len(), 1);
        assert_eq!(guard.newest().unwrap().sample_id, 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let repo = Arc::new(FakeRepo {
            boundaries: ZoneBoundaries::new(100.0, 2.0).unwrap(),
            samples: vec![sample(1, 100.0)],
            load_calls: AtomicUsize::new(0),
        });
        let manager = WindowManager::new(10, 25, repo.clone());
        manager.get(42).await.unwrap();
        manager.invalidate(42).await;
        manager.get(42).await.unwrap();
        assert_eq!(repo.load_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lru_eviction_drops_least_recently_touched() {
        let repo = Arc::new(FakeRepo {
            boundaries: ZoneBoundaries::new(100.0, 2.0).unwrap(),
            samples: vec![],
            load_calls: AtomicUsize::new(0),
        });
        let manager = WindowManager::new(2, 25, repo);
        manager.get(1).await.unwrap();
        manager.get(2).await.unwrap();
        // Touch 1 so 2 becomes least-recently-used.
        manager.get(1).await.unwrap();
        manager.get(3).await.unwrap();
        let ids = manager.cached_ids().await;
        assert!(ids.contains(&1));
        assert!(ids.contains(&3));
        assert!(!ids.contains(&2));
    }

    #[tokio::test]
    async fn size_and_cached_ids_reflect_cache_contents() {
        let repo = Arc::new(FakeRepo {
            boundaries: ZoneBoundaries::new(100.0, 2.0).unwrap(),
            samples: vec![],
            load_calls: AtomicUsize::new(0),
        });
        let manager = WindowManager::new(10, 25, repo);
        manager.get(1).await.unwrap();
        manager.get(2).await.unwrap();
        assert_eq!(manager.size().await, 2);
        assert_eq!(manager.cached_ids().await.len(), 2);
    }
}
