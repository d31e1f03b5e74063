//! Layer-keyed image cache with single-flight builds.
//!
//! At most one build runs per key: the builder holds the key's slot lock
//! while its `build_fn` runs, and concurrent requesters for the same key
//! queue on that lock and observe the stored result (Ready or Failed)
//! instead of racing a duplicate build.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use benchgate_core::{Layer, LayerKey, ValidationError};
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, ImageRef};

/// Lifetime policy per layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Kept for the life of the process (base images).
    LongLived,

    /// Kept while warm; evictable once idle (environment images).
    Medium,

    /// Removed as soon as its pipeline releases it (instance images).
    Ephemeral,
}

impl CacheTier {
    /// Tier for a layer.
    pub fn for_layer(layer: Layer) -> Self {
        match layer {
            Layer::Base => CacheTier::LongLived,
            Layer::Environment => CacheTier::Medium,
            Layer::Instance => CacheTier::Ephemeral,
        }
    }

    /// Maximum idle time before a zero-ref entry is evictable.
    /// `None` means never evicted by idleness.
    pub fn max_idle(&self) -> Option<Duration> {
        match self {
            CacheTier::LongLived => None,
            CacheTier::Medium => Some(Duration::from_secs(2 * 60 * 60)),
            CacheTier::Ephemeral => Some(Duration::ZERO),
        }
    }
}

/// A built, reusable image owned by the cache.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    /// Key the image was built under.
    pub key: LayerKey,

    /// Runtime handle to the image.
    pub image: ImageRef,
}

/// Build state of one cache slot.
enum Slot {
    /// No build has completed yet.
    Pending,

    /// Image is built and reusable.
    Ready(ImageRef),

    /// The build failed; the error is replayed to later requesters until
    /// a `force_rebuild` replaces the entry.
    Failed(ValidationError),
}

struct Entry {
    layer: Layer,
    slot: tokio::sync::Mutex<Slot>,
    refs: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl Entry {
    fn new(layer: Layer) -> Self {
        Self {
            layer,
            slot: tokio::sync::Mutex::new(Slot::Pending),
            refs: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().expect("last_used poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().expect("last_used poisoned").elapsed()
    }
}

/// Process-wide image cache. The only shared mutable resource between
/// instance pipelines.
pub struct ImageCache {
    runtime: Arc<dyn ContainerRuntime>,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl ImageCache {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry_for(&self, key: &LayerKey) -> Arc<Entry> {
        let mut entries = self.entries.lock().expect("cache map poisoned");
        Arc::clone(
            entries
                .entry(key.digest.clone())
                .or_insert_with(|| Arc::new(Entry::new(key.layer))),
        )
    }

    /// Return the image for `key`, building it if needed.
    ///
    /// Cache hit: returns the Ready image immediately. In-flight build:
    /// awaits that build's result. Absent or `force_rebuild`: runs
    /// `build_fn` while holding the key's slot, then stores Ready/Failed.
    /// Every successful return takes one reference; callers pair it with
    /// [`ImageCache::release`].
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &LayerKey,
        force_rebuild: bool,
        build_fn: F,
    ) -> Result<BuiltImage, ValidationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ImageRef, ValidationError>>,
    {
        let entry = self.entry_for(key);
        let mut slot = entry.slot.lock().await;

        if !force_rebuild {
            match &*slot {
                Slot::Ready(image) => {
                    debug!(key = %key, "Image cache hit");
                    entry.refs.fetch_add(1, Ordering::SeqCst);
                    entry.touch();
                    return Ok(BuiltImage {
                        key: key.clone(),
                        image: image.clone(),
                    });
                }
                Slot::Failed(err) => {
                    debug!(key = %key, "Image cache replaying failed build");
                    return Err(err.clone());
                }
                Slot::Pending => {}
            }
        }

        info!(key = %key, force_rebuild, "Building image");
        match build_fn().await {
            Ok(image) => {
                *slot = Slot::Ready(image.clone());
                entry.refs.fetch_add(1, Ordering::SeqCst);
                entry.touch();
                Ok(BuiltImage {
                    key: key.clone(),
                    image,
                })
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Image build failed");
                *slot = Slot::Failed(err.clone());
                Err(err)
            }
        }
    }

    /// Release one reference taken by `get_or_build`. When an
    /// ephemeral-tier entry drops to zero references it is evicted and its
    /// image removed through the runtime.
    pub async fn release(&self, key: &LayerKey) {
        let entry = {
            let entries = self.entries.lock().expect("cache map poisoned");
            match entries.get(&key.digest) {
                Some(entry) => Arc::clone(entry),
                None => return,
            }
        };

        // Saturating decrement: an unpaired release must not wrap.
        let _ = entry
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let remaining = entry.refs.load(Ordering::SeqCst);
        entry.touch();

        if remaining == 0 && CacheTier::for_layer(entry.layer) == CacheTier::Ephemeral {
            self.evict(key, &entry).await;
        }
    }

    /// Evict idle zero-reference entries whose tier max-idle has expired.
    pub async fn evict_idle(&self) {
        let victims: Vec<(LayerKey, Arc<Entry>)> = {
            let entries = self.entries.lock().expect("cache map poisoned");
            entries
                .iter()
                .filter(|(_, entry)| entry.refs.load(Ordering::SeqCst) == 0)
                .filter(|(_, entry)| {
                    CacheTier::for_layer(entry.layer)
                        .max_idle()
                        .is_some_and(|max| entry.idle_for() >= max)
                })
                .map(|(digest, entry)| {
                    (
                        LayerKey {
                            layer: entry.layer,
                            digest: digest.clone(),
                        },
                        Arc::clone(entry),
                    )
                })
                .collect()
        };

        for (key, entry) in victims {
            self.evict(&key, &entry).await;
        }
    }

    async fn evict(&self, key: &LayerKey, entry: &Arc<Entry>) {
        // Skip entries whose build is still in flight.
        let image = match entry.slot.try_lock() {
            Ok(slot) => match &*slot {
                Slot::Ready(image) => Some(image.clone()),
                _ => None,
            },
            Err(_) => return,
        };

        self.entries
            .lock()
            .expect("cache map poisoned")
            .remove(&key.digest);

        if let Some(image) = image {
            debug!(key = %key, tag = %image.tag, "Evicting image");
            if let Err(e) = self.runtime.remove_image(&image).await {
                warn!(key = %key, error = %e, "Failed to remove evicted image");
            }
        }
    }

    /// Number of live cache entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache map poisoned").len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
