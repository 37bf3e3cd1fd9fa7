//! Build latches keyed by image name.
//!
//! A latch is opened by the caller that claims an image build and is
//! counted down once the image is committed. Everyone else asking for the
//! same name waits on it instead of starting a second build.
//!
//! Entries are never removed. An opened latch stays in the map after it is
//! counted down, and a later rebuild of the same name replaces it with a
//! fresh one, so there is at most one entry per name. A latch dropped
//! without being released leaves its name [`BuildState::Abandoned`]: any
//! tag the failed build left behind must not be reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{FleetError, FleetResult};

/// Default bound on a latch wait.
pub const DEFAULT_IMAGE_WAIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Configuration for the image cache.
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    /// How long a caller waits for another caller's build.
    pub wait_timeout: Duration,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_IMAGE_WAIT_TIMEOUT,
        }
    }
}

/// Where the latest build of an image name stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    Built,
    /// The build failed before its commit.
    Abandoned,
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub opened: AtomicU64,
    pub contended: AtomicU64,
    pub waits: AtomicU64,
    pub marks: AtomicU64,
}

/// Claim on an in-flight image build.
///
/// [`ImageLatch::release`] counts it down as built. Dropping it unreleased
/// counts it down as abandoned, so a build that fails part way never
/// leaves waiters hanging.
#[derive(Debug)]
pub struct ImageLatch {
    name: String,
    state: Arc<watch::Sender<BuildState>>,
    previous: Option<BuildState>,
}

impl ImageLatch {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the build this latch replaced was abandoned.
    pub fn follows_abandoned(&self) -> bool {
        self.previous == Some(BuildState::Abandoned)
    }

    /// Count the latch down as built, releasing all waiters.
    pub fn release(self) {
        if settle(&self.state, BuildState::Built) {
            debug!(image = %self.name, "Image latch released");
        }
    }
}

impl Drop for ImageLatch {
    fn drop(&mut self) {
        if settle(&self.state, BuildState::Abandoned) {
            warn!(image = %self.name, "Image build abandoned");
        }
    }
}

/// Move a pending latch to `to`. False if it had already settled.
fn settle(state: &watch::Sender<BuildState>, to: BuildState) -> bool {
    state.send_if_modified(|current| {
        if *current == BuildState::Pending {
            *current = to;
            true
        } else {
            false
        }
    })
}

/// Registry of build latches for one host.
pub struct ImageCache {
    config: ImageCacheConfig,
    latches: Mutex<HashMap<String, Arc<watch::Sender<BuildState>>>>,
    stats: CacheStats,
}

impl ImageCache {
    pub fn new(config: ImageCacheConfig) -> Self {
        Self {
            config,
            latches: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Block until the latch for `name` is counted down.
    ///
    /// Returns at once if no build of `name` was ever opened. Never creates
    /// an entry. A build that was abandoned also ends the wait; check
    /// [`state`](Self::state) before trusting its tag.
    pub async fn wait(&self, name: &str) -> FleetResult<()> {
        let mut rx = {
            let latches = self.latches.lock().await;
            match latches.get(name) {
                Some(state) => state.subscribe(),
                None => return Ok(()),
            }
        };

        if *rx.borrow() != BuildState::Pending {
            return Ok(());
        }

        self.stats.waits.fetch_add(1, Ordering::Relaxed);
        debug!(image = %name, "Waiting for in-flight image build");

        let started = Instant::now();
        // A closed channel means the sender is gone, which only happens
        // once the cache itself is dropped.
        let waited = tokio::time::timeout(
            self.config.wait_timeout,
            rx.wait_for(|state| *state != BuildState::Pending),
        )
        .await
        .map(|_| ());

        waited.map_err(|_| FleetError::Timeout {
            what: format!("image build of {name}"),
            elapsed: started.elapsed(),
        })
    }

    /// Count down the latch for `name` as built, if one is present.
    ///
    /// An abandoned name becomes built again, since the commit that calls
    /// this has just produced a complete image.
    pub async fn mark(&self, name: &str) {
        let latches = self.latches.lock().await;
        if let Some(state) = latches.get(name) {
            let changed = state.send_if_modified(|current| {
                let was = *current;
                *current = BuildState::Built;
                was != BuildState::Built
            });
            if changed {
                self.stats.marks.fetch_add(1, Ordering::Relaxed);
                info!(image = %name, "Image marked as built");
            }
        }
    }

    /// Claim the build of `name`.
    ///
    /// Returns `None` while another build of `name` is still in flight.
    pub async fn open(&self, name: &str) -> Option<ImageLatch> {
        let mut latches = self.latches.lock().await;
        let previous = latches.get(name).map(|state| *state.borrow());
        if previous == Some(BuildState::Pending) {
            self.stats.contended.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let (tx, _) = watch::channel(BuildState::Pending);
        let state = Arc::new(tx);
        latches.insert(name.to_string(), Arc::clone(&state));
        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        debug!(image = %name, "Opened image latch");

        Some(ImageLatch {
            name: name.to_string(),
            state,
            previous,
        })
    }

    /// State of the latest build of `name`, if one was ever opened.
    pub async fn state(&self, name: &str) -> Option<BuildState> {
        let latches = self.latches.lock().await;
        latches.get(name).map(|state| *state.borrow())
    }

    /// True while a build of `name` is in flight.
    pub async fn is_pending(&self, name: &str) -> bool {
        self.state(name).await == Some(BuildState::Pending)
    }

    /// True if the latest build of `name` failed before its commit.
    pub async fn is_abandoned(&self, name: &str) -> bool {
        self.state(name).await == Some(BuildState::Abandoned)
    }

    /// Number of names that have ever been opened.
    pub async fn len(&self) -> usize {
        self.latches.lock().await.len()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
