//! Shared service handles
//!
//! Explicit construction and injection of every pluggable subsystem. The
//! instance id is generated once here and flows to everything that needs to
//! stamp or compare origins; nothing reads it from the environment later.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::broker::{self, Broker};
use crate::config::Config;
use crate::envelope::{BrokerFrame, InstanceId};
use crate::error::FabricError;
use crate::monitoring::Metrics;
use crate::scheduler::{self, Scheduler};
use crate::state::{self, StateStore};
use crate::utils::retry_with_backoff;

/// Attempts and base delay for membership writes. Exhaustion terminates the
/// affected connection to keep the store consistent with local maps.
pub const STATE_RETRY_ATTEMPTS: u32 = 4;
pub const STATE_RETRY_BASE: Duration = Duration::from_millis(50);

const PUBLISH_RETRY_BASE: Duration = Duration::from_millis(50);

pub struct Services {
    pub config: Arc<Config>,
    pub instance_id: InstanceId,
    pub state: Arc<dyn StateStore>,
    pub broker: Arc<dyn Broker>,
    pub scheduler: Arc<dyn Scheduler>,
    pub metrics: Metrics,
}

impl Services {
    /// Build every backend from configuration.
    pub async fn from_config(config: Arc<Config>) -> anyhow::Result<Arc<Self>> {
        let instance_id = config
            .instance_id
            .clone()
            .map(InstanceId::new)
            .unwrap_or_else(InstanceId::generate);

        let state = state::create(config.state_backend, &config.redis_url).await?;
        let broker =
            broker::create(config.broker_backend, &config.redis_url, config.broker_op_timeout).await?;
        let scheduler =
            scheduler::create(config.scheduler_backend, &config.redis_url, &instance_id).await?;

        Ok(Arc::new(Self {
            config,
            instance_id,
            state,
            broker,
            scheduler,
            metrics: Metrics::default(),
        }))
    }

    /// Compose from pre-built backends. Lets tests (and embedded setups) run
    /// several instances against shared memory backends.
    pub fn with_backends(
        config: Arc<Config>,
        instance_id: InstanceId,
        state: Arc<dyn StateStore>,
        broker: Arc<dyn Broker>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            instance_id,
            state,
            broker,
            scheduler,
            metrics: Metrics::default(),
        })
    }

    /// Publish a broker frame, retrying with back-off. When the budget is
    /// exhausted the envelope is dropped and counted; fan-out is best-effort
    /// by contract.
    pub async fn publish_frame(&self, topic: &str, frame: &BrokerFrame) {
        let payload = match frame.encode() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                tracing::error!(topic = %topic, err = %e, "Broker frame encode failed");
                self.metrics.record_publish_dropped();
                return;
            }
        };

        let attempts = self.config.publish_max_retries.max(1);
        let result = retry_with_backoff(attempts, PUBLISH_RETRY_BASE, || {
            let payload = payload.clone();
            async move { self.broker.publish(topic, payload).await }
        })
        .await;

        if let Err(e) = result {
            tracing::error!(
                topic = %topic,
                event = %frame.envelope.event,
                namespace = %frame.envelope.namespace,
                err = %e,
                "Publish retries exhausted, envelope dropped"
            );
            self.metrics.record_publish_dropped();
        }
    }

    /// Membership write with the bounded retry policy. The caller terminates
    /// the affected connection when this fails.
    pub async fn state_write<F, Fut>(&self, op: F) -> Result<(), FabricError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), FabricError>>,
    {
        retry_with_backoff(STATE_RETRY_ATTEMPTS, STATE_RETRY_BASE, op).await
    }
}
