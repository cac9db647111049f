//! In-process lease table
//!
//! Backs leader-only tasks when the cluster is a single process. Tests share
//! one table between schedulers to model multiple instances.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::LeaseProvider;

#[derive(Default)]
pub struct LocalLeaseTable {
    leases: Mutex<HashMap<String, Instant>>,
}

impl LocalLeaseTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseProvider for LocalLeaseTable {
    async fn try_acquire(&self, task_id: &str, lease: Duration) -> bool {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get(task_id) {
            Some(expiry) if *expiry > now => false,
            _ => {
                leases.insert(task_id.to_string(), now + lease);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_excludes_second_holder_until_expiry() {
        let table = LocalLeaseTable::new();
        assert!(table.try_acquire("t", Duration::from_millis(50)).await);
        assert!(!table.try_acquire("t", Duration::from_millis(50)).await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(table.try_acquire("t", Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn leases_are_independent_per_task() {
        let table = LocalLeaseTable::new();
        assert!(table.try_acquire("a", Duration::from_secs(10)).await);
        assert!(table.try_acquire("b", Duration::from_secs(10)).await);
    }
}
