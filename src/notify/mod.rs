//! Notification dispatch.
//!
//! Every (alert, channel) pair is delivered independently. A channel is
//! identified by its endpoint URL; each endpoint gets its own rate limiter and
//! concurrency cap, shared by every alert rule that points at it. Failures are
//! retried with backoff, then recorded as a failed [`NotificationAttempt`].
//! The alert itself is never touched here.

pub mod channel;
pub mod chat;
pub mod retry;
pub mod webhook;

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::models::{Alert, ChannelTarget, DeliveryOutcome, NotificationAttempt};
use crate::store::Store;
pub use channel::{HttpSender, NotificationSender};
use retry::{retry_with_backoff, RetryPolicy};

struct ChannelGate {
    limiter: DefaultDirectRateLimiter,
    permits: Semaphore,
}

pub struct Dispatcher {
    sender: Arc<dyn NotificationSender>,
    store: Arc<dyn Store>,
    policy: RetryPolicy,
    timeout: Duration,
    rate_per_sec: NonZeroU32,
    concurrency: usize,
    gates: DashMap<String, Arc<ChannelGate>>,
}

impl Dispatcher {
    /// Dispatcher delivering over HTTP.
    pub fn new(config: &NotificationConfig, store: Arc<dyn Store>) -> Result<Self> {
        let sender = Arc::new(HttpSender::new(config.request_timeout())?);
        Ok(Self::with_sender(config, store, sender))
    }

    pub fn with_sender(config: &NotificationConfig, store: Arc<dyn Store>, sender: Arc<dyn NotificationSender>) -> Self {
        Self {
            sender,
            store,
            policy: RetryPolicy::from_config(config),
            timeout: config.request_timeout(),
            rate_per_sec: NonZeroU32::new(config.per_channel_rate_per_sec).unwrap_or(NonZeroU32::MIN),
            concurrency: config.per_channel_concurrency.max(1),
            gates: DashMap::new(),
        }
    }

    fn gate(&self, target: &ChannelTarget) -> Arc<ChannelGate> {
        self.gates
            .entry(target.config.endpoint().to_string())
            .or_insert_with(|| {
                Arc::new(ChannelGate {
                    limiter: RateLimiter::direct(Quota::per_second(self.rate_per_sec)),
                    permits: Semaphore::new(self.concurrency),
                })
            })
            .clone()
    }

    /// Deliver to every enabled channel concurrently. One attempt record per channel.
    pub async fn dispatch(&self, alert: &Alert, channels: &[ChannelTarget], escalation: bool) -> Vec<NotificationAttempt> {
        let deliveries = channels
            .iter()
            .filter(|c| c.config.enabled())
            .map(|c| self.deliver(alert, c, escalation));
        join_all(deliveries).await
    }

    /// Deliver one alert to one channel with retries, and record the outcome.
    pub async fn deliver(&self, alert: &Alert, target: &ChannelTarget, escalation: bool) -> NotificationAttempt {
        let gate = self.gate(target);
        let retried = match gate.permits.acquire().await {
            Ok(_permit) => {
                retry_with_backoff(&self.policy, PipelineError::is_transient, |_| {
                    let gate = gate.clone();
                    async move {
                        gate.limiter.until_ready().await;
                        match tokio::time::timeout(self.timeout, self.sender.send(target, alert, escalation)).await {
                            Ok(result) => result,
                            Err(_) => Err(PipelineError::timeout(format!(
                                "{} delivery timed out after {:?}",
                                target.config.channel_type(),
                                self.timeout
                            ))),
                        }
                    }
                })
                .await
            }
            Err(_) => retry::Retried { result: Err(PipelineError::internal("channel gate closed")), attempts: 0 },
        };

        let channel_type = target.config.channel_type();
        let outcome = match &retried.result {
            Ok(()) => {
                info!(alert_id = %alert.id, channel = %target.id, attempts = retried.attempts, escalation, "notification delivered");
                metrics::inc_notifications(channel_type, "delivered");
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                warn!(alert_id = %alert.id, channel = %target.id, attempts = retried.attempts, error = %e, "notification failed");
                metrics::inc_notifications(channel_type, "failed");
                DeliveryOutcome::Failed { reason: e.to_string() }
            }
        };
        let attempt = NotificationAttempt {
            alert_id: alert.id.clone(),
            channel_id: target.id.clone(),
            channel_type: channel_type.to_string(),
            outcome,
            timestamp: Utc::now(),
            retry_count: retried.attempts.saturating_sub(1),
            escalation,
        };
        if let Err(e) = self.store.append_attempt(&attempt).await {
            warn!(alert_id = %alert.id, channel = %target.id, error = %e, "failed to record notification attempt");
        }
        attempt
    }
}
