//! Redis lease store
//!
//! Cluster-wide leader leases via `SET NX PX`. The value records the owning
//! instance for observability; the lease is never released explicitly and
//! simply expires.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::envelope::InstanceId;

use super::LeaseProvider;

pub struct RedisLeaseStore {
    conn: ConnectionManager,
    instance_id: InstanceId,
}

impl RedisLeaseStore {
    pub async fn connect(redis_url: &str, instance_id: InstanceId) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, instance_id })
    }

    fn lock_key(task_id: &str) -> String {
        format!("sched:lock:{task_id}")
    }
}

#[async_trait]
impl LeaseProvider for RedisLeaseStore {
    async fn try_acquire(&self, task_id: &str, lease: Duration) -> bool {
        let mut conn = self.conn.clone();
        let result: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(Self::lock_key(task_id))
            .arg(self.instance_id.as_str())
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(reply) => reply.is_some(),
            Err(e) => {
                // On a lease-store failure the safe answer is "not leader":
                // the task is skipped this period rather than run twice.
                tracing::warn!(task_id = %task_id, err = %e, "Lease acquisition failed");
                false
            }
        }
    }
}
