use parking_lot::Mutex;

use eavstore_core::{AppId, ZoneId};
use eavstore_engine::CacheListener;

/// Cache listener that remembers every purge signal it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    purges: Mutex<Vec<(ZoneId, AppId)>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purges(&self) -> Vec<(ZoneId, AppId)> {
        self.purges.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.purges.lock().len()
    }
}

impl CacheListener for RecordingListener {
    fn purge_cache(&self, zone_id: ZoneId, app_id: AppId) {
        self.purges.lock().push((zone_id, app_id));
    }
}
