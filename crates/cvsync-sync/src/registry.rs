use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

/// Files currently being processed by one orchestrator. Registration is the
/// only re-entry guard; nothing is queued or persisted.
#[derive(Debug, Default)]
pub struct ActiveProcessRegistry {
    active: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl ActiveProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `file_name`, or `None` when it is already active. The entry is
    /// removed when the returned guard drops.
    pub fn try_register(&self, file_name: &str) -> Option<ActiveProcessGuard<'_>> {
        let mut active = self.lock();
        if active.contains_key(file_name) {
            return None;
        }
        active.insert(file_name.to_string(), Utc::now());
        Some(ActiveProcessGuard {
            registry: self,
            file_name: file_name.to_string(),
        })
    }

    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        self.lock()
            .iter()
            .map(|(name, started)| (name.clone(), *started))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DateTime<Utc>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub struct ActiveProcessGuard<'a> {
    registry: &'a ActiveProcessRegistry,
    file_name: String,
}

impl ActiveProcessGuard<'_> {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl Drop for ActiveProcessGuard<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.file_name);
    }
}
