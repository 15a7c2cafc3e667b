use std::collections::HashMap;
use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

/// Last-seen instants of the devices currently considered active.
///
/// A device is active exactly while it has an entry. `touch` and `sweep`
/// go through the same lock, so a sweep never judges a device on a value
/// that a concurrent `touch` is about to replace.
#[derive(Clone, Default)]
pub struct ActivityTracker {
    devices: Arc<Mutex<HashMap<String, OffsetDateTime>>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `device_id` was heard from at `now`.
    ///
    /// Returns `true` when the device had no entry, i.e. it just became active.
    pub async fn touch(&self, device_id: &str, now: OffsetDateTime) -> bool {
        let mut devices = self.devices.lock().await;

        match devices.get_mut(device_id) {
            Some(last_seen) => {
                if now > *last_seen {
                    *last_seen = now;
                }
                false
            }
            None => {
                devices.insert(device_id.to_string(), now);
                true
            }
        }
    }

    /// Removes and returns the devices silent for strictly longer than `threshold`.
    pub async fn sweep(&self, now: OffsetDateTime, threshold: Duration) -> Vec<String> {
        let mut devices = self.devices.lock().await;
        let mut inactive = Vec::new();

        devices.retain(|device_id, last_seen| {
            let stale = now - *last_seen > threshold;
            if stale {
                inactive.push(device_id.clone());
            }
            !stale
        });

        inactive.sort();
        inactive
    }

    pub async fn active_count(&self) -> usize {
        self.devices.lock().await.len()
    }

    pub async fn is_active(&self, device_id: &str) -> bool {
        self.devices.lock().await.contains_key(device_id)
    }

    pub async fn last_seen(&self, device_id: &str) -> Option<OffsetDateTime> {
        self.devices.lock().await.get(device_id).copied()
    }
}
