//! Reference-counted sharing of pooled resources
//!
//! Several partition readers of one job usually target the same database.
//! [`ResourceMap`] hands them one shared instance per key (the source's
//! connection string), counts users, and closes the instance when the last
//! user releases it.
//!
//! ```rust,ignore
//! let db = sluice_rdbc::reuse::open_db(source.clone()).await?;
//! db.fetch_record(&param, |record| { /* ... */ Ok(()) }, &cancel).await?;
//! db.release().await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::db::Db;
use crate::error::Result;
use crate::source::Source;

/// Something that must be closed when its last user is done
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// Release the underlying connections
    async fn close(&self) -> Result<()>;
}

struct Slot<R> {
    resource: Arc<R>,
    count: usize,
    // distinguishes a slot from a later one stored under the same key
    generation: u64,
}

/// Map from key to a shared resource and its user count
pub struct ResourceMap<R: Resource> {
    slots: Mutex<HashMap<String, Slot<R>>>,
    next_generation: AtomicU64,
}

impl<R: Resource> Default for ResourceMap<R> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<R: Resource> ResourceMap<R> {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Share the resource stored under `key`, building it when absent.
    ///
    /// The lock is not held while `load_or_new` runs. When two callers
    /// build the same key at once, the later one closes its copy and
    /// shares the stored one. A failed build leaves the map untouched.
    pub async fn get<F, Fut>(self: &Arc<Self>, key: &str, load_or_new: F) -> Result<Shared<R>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.count += 1;
            debug!(key = %key_label(key), count = slot.count, "reusing shared resource");
            return Ok(self.shared(key, slot.resource.clone(), slot.generation));
        }

        let fresh = Arc::new(load_or_new().await?);

        let (resource, generation, loser) = match self.slots.lock().entry(key.to_owned()) {
            Entry::Occupied(mut slot) => {
                let slot = slot.get_mut();
                slot.count += 1;
                (slot.resource.clone(), slot.generation, Some(fresh))
            }
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                slot.insert(Slot {
                    resource: fresh.clone(),
                    count: 1,
                    generation,
                });
                (fresh, generation, None)
            }
        };

        if let Some(loser) = loser {
            warn!(key = %key_label(key), "discarding concurrently built resource");
            if let Err(e) = loser.close().await {
                warn!(key = %key_label(key), error = %e, "failed to close discarded resource");
            }
        }
        Ok(self.shared(key, resource, generation))
    }

    fn shared(self: &Arc<Self>, key: &str, resource: Arc<R>, generation: u64) -> Shared<R> {
        Shared {
            key: key.to_owned(),
            resource,
            map: self.clone(),
            generation,
            released: AtomicBool::new(false),
        }
    }

    /// Drop one use of `key`, closing the resource after the last one.
    ///
    /// Unknown keys are ignored.
    pub async fn release(&self, key: &str) -> Result<()> {
        self.release_slot(key, None).await
    }

    /// Release `key` only while it still holds the slot of `generation`;
    /// handles that outlived a [`Self::reset`] must not touch a newer slot
    async fn release_slot(&self, key: &str, generation: Option<u64>) -> Result<()> {
        let closing = {
            let mut slots = self.slots.lock();
            let last = match slots.get_mut(key) {
                Some(slot) if generation.map_or(true, |g| g == slot.generation) => {
                    slot.count -= 1;
                    slot.count == 0
                }
                Some(_) => {
                    debug!(key = %key_label(key), "ignoring release of a stale handle");
                    false
                }
                None => false,
            };
            if last {
                slots.remove(key).map(|slot| slot.resource)
            } else {
                None
            }
        };

        if let Some(resource) = closing {
            debug!(key = %key_label(key), "closing shared resource");
            resource.close().await?;
        }
        Ok(())
    }

    /// Current number of users of `key`
    pub fn use_count(&self, key: &str) -> usize {
        self.slots.lock().get(key).map_or(0, |slot| slot.count)
    }

    /// Number of keys in the map
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the map holds no resources
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Close every resource and empty the map, regardless of counts
    pub async fn reset(&self) -> Result<()> {
        let drained: Vec<(String, Slot<R>)> = self.slots.lock().drain().collect();
        let mut first_err = None;
        for (key, slot) in drained {
            if let Err(e) = slot.resource.close().await {
                warn!(key = %key_label(&key), error = %e, "failed to close resource on reset");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Pool keys carry credentials; log only the scheme and host part
fn key_label(key: &str) -> String {
    crate::connection::redact_url(key)
}

/// One user's handle on a shared resource.
///
/// [`Shared::release`] gives the use back; only the first call counts.
/// A handle dropped without release is released in the background.
pub struct Shared<R: Resource> {
    key: String,
    resource: Arc<R>,
    map: Arc<ResourceMap<R>>,
    generation: u64,
    released: AtomicBool,
}

impl<R: Resource> Shared<R> {
    /// Key the resource is shared under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The shared resource
    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    /// Give this use back to the map
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.map.release_slot(&self.key, Some(self.generation)).await
    }
}

impl<R: Resource> Deref for Shared<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

impl<R: Resource> Drop for Shared<R> {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let map = self.map.clone();
            let key = std::mem::take(&mut self.key);
            let generation = self.generation;
            handle.spawn(async move {
                if let Err(e) = map.release_slot(&key, Some(generation)).await {
                    warn!(key = %key_label(&key), error = %e, "background release failed");
                }
            });
        }
    }
}

#[async_trait]
impl Resource for Db {
    async fn close(&self) -> Result<()> {
        Db::close(self).await
    }
}

static DEFAULT_DB_MAP: LazyLock<Arc<ResourceMap<Db>>> = LazyLock::new(|| Arc::new(ResourceMap::new()));

/// Process-wide map of shared [`Db`]s
pub fn default_db_map() -> &'static Arc<ResourceMap<Db>> {
    &DEFAULT_DB_MAP
}

/// Open or share the [`Db`] of `source` in the process-wide map
pub async fn open_db(source: Arc<dyn Source>) -> Result<Shared<Db>> {
    open_db_in(default_db_map(), source).await
}

/// Open or share the [`Db`] of `source` in `map`
pub async fn open_db_in(map: &Arc<ResourceMap<Db>>, source: Arc<dyn Source>) -> Result<Shared<Db>> {
    let key = source.key().to_owned();
    map.get(&key, || Db::open(source)).await
}
