//! In-memory snapshot store.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use super::{Snapshot, SnapshotError, SnapshotStore};

type SnapshotMap = HashMap<(String, String), Snapshot>;

/// Reference snapshot store for tests and development. Cloning shares the
/// underlying storage.
#[derive(Clone, Default)]
pub struct Store {
    snapshots: Arc<RwLock<SnapshotMap>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for Store {
    async fn get(&self, id: &str, aggregate_type: &str) -> Result<Snapshot, SnapshotError> {
        let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
        snapshots
            .get(&(id.to_string(), aggregate_type.to_string()))
            .cloned()
            .ok_or(SnapshotError::NotFound)
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        if snapshot.id.is_empty() {
            return Err(SnapshotError::EmptyId);
        }
        let key = (snapshot.id.clone(), snapshot.aggregate_type.clone());
        let mut snapshots = self
            .snapshots
            .write()
            .expect("snapshot store lock poisoned");
        snapshots.insert(key, snapshot);
        Ok(())
    }
}
