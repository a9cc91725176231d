use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use eavstore_core::{AppId, ContentType, ZoneId};

/// Receives the post-commit signal that cached reads of an app are stale.
pub trait CacheListener: Send + Sync {
    fn purge_cache(&self, zone_id: ZoneId, app_id: AppId);
}

/// Content types per app, loaded on first use and dropped wholesale on
/// [`invalidate`](Self::invalidate). Share it with `Arc`.
#[derive(Default)]
pub struct ContentTypeCache {
    apps: RwLock<HashMap<AppId, Arc<Vec<ContentType>>>>,
    generation: AtomicU64,
}

impl ContentTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached types for `app_id`, running `load` on a miss.
    pub fn get_or_load<E>(
        &self,
        app_id: AppId,
        load: impl FnOnce() -> Result<Vec<ContentType>, E>,
    ) -> Result<Arc<Vec<ContentType>>, E> {
        if let Some(types) = self.apps.read().get(&app_id) {
            return Ok(Arc::clone(types));
        }
        let loaded = Arc::new(load()?);
        let mut apps = self.apps.write();
        let entry = apps.entry(app_id).or_insert(loaded);
        Ok(Arc::clone(entry))
    }

    pub fn invalidate(&self, app_id: AppId) {
        if self.apps.write().remove(&app_id).is_some() {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn invalidate_all(&self) {
        let mut apps = self.apps.write();
        if !apps.is_empty() {
            apps.clear();
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_cached(&self, app_id: AppId) -> bool {
        self.apps.read().contains_key(&app_id)
    }

    /// Bumped on every invalidation that dropped something.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

/// Find a type by static name, falling back to its display name.
pub fn find_content_type<'a>(types: &'a [ContentType], name: &str) -> Option<&'a ContentType> {
    types
        .iter()
        .find(|ct| ct.static_name.eq_ignore_ascii_case(name))
        .or_else(|| types.iter().find(|ct| ct.matches(name)))
}
