//! Event processing: evaluate, persist, fold, alert, notify.
//!
//! [`Pipeline::process`] handles one event end to end. The stored assessment
//! is the commit marker: it is written only after the alert stage succeeds,
//! so an event that failed part way is processed again on redelivery. Session
//! folds, trigger keys and threshold windows each drop the repeat on their
//! own, which leaves only the unfinished work to run.
//!
//! [`Pipeline::start`] runs events on source-hash shards so that one source is
//! always processed by the same worker, in arrival order, while different
//! sources proceed in parallel. A worker redelivers an event that failed with
//! a transient error. Background tickers drive escalations and the session
//! sweep.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerting::escalation::EscalationScheduler;
use crate::alerting::{AlertEngine, Raised};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::evaluator;
use crate::metrics;
use crate::models::{Event, NotificationAttempt, RiskAssessment, SessionState};
use crate::notify::retry::{retry_with_backoff, RetryPolicy};
use crate::notify::Dispatcher;
use crate::rules::{PublishReport, RuleRegistry};
use crate::session::SessionAggregator;
use crate::store::Store;

/// Everything that happened to one event.
#[derive(Debug, Clone, Serialize)]
pub struct Processed {
    pub assessment: RiskAssessment,
    pub session: Option<SessionState>,
    #[serde(skip)]
    pub alerts: Vec<Raised>,
    pub notifications: Vec<NotificationAttempt>,
    pub replayed: bool,
}

impl Processed {
    fn replay(assessment: RiskAssessment) -> Self {
        Self { assessment, session: None, alerts: Vec::new(), notifications: Vec::new(), replayed: true }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn Store>,
    registry: Arc<RuleRegistry>,
    aggregator: Arc<SessionAggregator>,
    engine: Arc<AlertEngine>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<EscalationScheduler>,
    /// Newest event time seen, in epoch millis. Sweeps run on event time.
    watermark: AtomicI64,
}

impl Pipeline {
    /// Pipeline delivering notifications over HTTP.
    pub fn new(config: PipelineConfig, store: Arc<dyn Store>) -> Result<Self> {
        let dispatcher = Dispatcher::new(&config.notifications, store.clone())?;
        Ok(Self::with_dispatcher(config, store, dispatcher))
    }

    pub fn with_dispatcher(config: PipelineConfig, store: Arc<dyn Store>, dispatcher: Dispatcher) -> Self {
        let registry = Arc::new(RuleRegistry::new());
        let aggregator = Arc::new(SessionAggregator::new(config.sessions.clone(), store.clone()));
        let engine = Arc::new(AlertEngine::new(config.alerting.clone(), store.clone()));
        let dispatcher = Arc::new(dispatcher);
        let scheduler = Arc::new(EscalationScheduler::new(
            store.clone(),
            engine.clone(),
            registry.clone(),
            dispatcher.clone(),
        ));
        Self { config, store, registry, aggregator, engine, dispatcher, scheduler, watermark: AtomicI64::new(i64::MIN) }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn aggregator(&self) -> &Arc<SessionAggregator> {
        &self.aggregator
    }

    pub fn engine(&self) -> &Arc<AlertEngine> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<EscalationScheduler> {
        &self.scheduler
    }

    async fn record_publish(&self, kind: &str, report: &PublishReport) {
        if let Err(e) = self.store.record_snapshot(kind, report).await {
            warn!(kind = %kind, version = report.version, error = %e, "failed to record rule snapshot");
        }
    }

    /// Publish detection rules from raw JSON definitions.
    pub async fn publish_rules(&self, raw: Vec<serde_json::Value>) -> PublishReport {
        let report = self.registry.publish_json(raw);
        self.record_publish("detection", &report).await;
        report
    }

    pub async fn publish_alert_rules(&self, raw: Vec<serde_json::Value>) -> PublishReport {
        let report = self.registry.publish_alert_rules_json(raw);
        self.record_publish("alert", &report).await;
        report
    }

    fn advance_watermark(&self, ts: DateTime<Utc>) {
        self.watermark.fetch_max(ts.timestamp_millis(), Ordering::SeqCst);
    }

    /// Newest event time processed so far.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match self.watermark.load(Ordering::SeqCst) {
            i64::MIN => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Run one event through every stage. `now` stamps alerts and drives
    /// suppression; event timestamps drive sessions and threshold windows.
    ///
    /// An event whose assessment is already stored is a replay and returns the
    /// stored assessment. An error means the event was not committed and is
    /// safe to process again.
    pub async fn process(&self, event: Event, now: DateTime<Utc>) -> Result<Processed> {
        let started = Instant::now();
        let event = event.received(now);
        let event_id = event.identity();
        match self.store.get_assessment(&event_id).await {
            Ok(Some(stored)) => {
                debug!(event_id = %event_id, "replayed event skipped");
                metrics::inc_events("replayed");
                return Ok(Processed::replay(stored));
            }
            Ok(None) => {}
            Err(e) => warn!(event_id = %event_id, error = %e, "assessment lookup failed; processing as new"),
        }

        let snapshot = self.registry.current();
        let assessment = evaluator::evaluate(&event, &snapshot);
        metrics::obs_evaluation("evaluate", started.elapsed().as_secs_f64());
        self.advance_watermark(assessment.timestamp);

        let fold = self.aggregator.fold(&assessment).await;
        if fold.replayed {
            debug!(event_id = %event_id, "session already holds event; resuming at alert stage");
        }

        let alert_rules = self.registry.alert_rules();
        let evaluation = self.engine.evaluate(&assessment, fold.session.as_ref(), &alert_rules, now).await;

        let mut notifications = Vec::new();
        for alert in evaluation.created() {
            let channels = alert
                .alert_rule
                .as_deref()
                .and_then(|name| alert_rules.get(name))
                .map(|r| r.channels.as_slice())
                .unwrap_or(&[]);
            notifications.extend(self.dispatcher.dispatch(alert, channels, false).await);
        }
        if let Some(e) = evaluation.error {
            warn!(event_id = %event_id, error = %e, "alert stage incomplete; event left uncommitted");
            return Err(e);
        }

        if !self.store.append_assessment(&assessment).await? {
            debug!(event_id = %event_id, "assessment committed by a concurrent delivery");
            metrics::inc_events("replayed");
            return Ok(Processed::replay(assessment));
        }
        metrics::inc_events(if assessment.is_assessed() { "assessed" } else { "unassessable" });
        for m in &assessment.matches {
            metrics::inc_rule_match(&m.rule);
        }

        metrics::obs_evaluation("process", started.elapsed().as_secs_f64());
        Ok(Processed { assessment, session: fold.session, alerts: evaluation.raised, notifications, replayed: false })
    }

    /// `process` with redelivery on transient errors. The ingest stamp is fixed
    /// before the first attempt so every attempt sees the same event time.
    pub async fn process_with_redelivery(&self, event: Event) -> Result<Processed> {
        let workers = &self.config.workers;
        let backoff = Duration::from_millis(workers.redelivery_backoff_ms);
        let policy = RetryPolicy {
            max_attempts: workers.max_redeliveries.saturating_add(1),
            initial_delay: backoff,
            max_delay: backoff.saturating_mul(16),
        };
        let event = event.received(Utc::now());
        let out = retry_with_backoff(&policy, PipelineError::is_transient, |_| {
            self.process(event.clone(), Utc::now())
        })
        .await;
        if let Err(e) = &out.result {
            error!(event_id = %event.identity(), attempts = out.attempts, error = %e, "event abandoned");
            metrics::inc_events("abandoned");
        }
        out.result
    }

    /// Close idle sessions and drop stale threshold windows, relative to the
    /// newest event time seen.
    pub async fn sweep(&self) -> Vec<SessionState> {
        let now = match self.watermark() {
            Some(w) => w,
            None => return Vec::new(),
        };
        let closed = self.aggregator.close_idle(now).await;
        let longest = self
            .registry
            .alert_rules()
            .threshold_rules()
            .filter_map(|r| r.threshold.as_ref().map(|t| t.time_window_secs))
            .max()
            .unwrap_or(0);
        self.engine.windows().prune(now - chrono::Duration::seconds(longest as i64));
        closed
    }

    /// Spawn shard workers and tickers. Processed events are sent to the
    /// returned receiver; dropping it discards them. Abandoned events are
    /// logged and counted, not sent.
    pub async fn start(self: Arc<Self>) -> (PipelineHandle, mpsc::Receiver<Processed>) {
        let shards = self.config.workers.shards.max(1);
        let depth = self.config.workers.queue_depth.max(1);
        let (out_tx, out_rx) = mpsc::channel(depth);
        let shutdown = CancellationToken::new();

        if let Err(e) = self.scheduler.recover(Utc::now()).await {
            warn!(error = %e, "escalation recovery failed; scheduler will retry on its next tick");
        }

        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, mut rx) = mpsc::channel::<Event>(depth);
            senders.push(tx);
            let pipeline = self.clone();
            let out = out_tx.clone();
            workers.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Ok(processed) = pipeline.process_with_redelivery(event).await {
                        let _ = out.send(processed).await;
                    }
                }
                debug!(shard, "shard worker drained");
            }));
        }
        drop(out_tx);

        let every = self.config.alerting.escalation_poll();
        let mut tickers = Vec::new();
        tickers.push(tokio::spawn(self.scheduler.clone().run(every, shutdown.clone())));
        let sweeper = self.clone();
        let token = shutdown.clone();
        tickers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = sweeper.sweep().await;
                        if !closed.is_empty() {
                            debug!(closed = closed.len(), "session sweep");
                        }
                    }
                }
            }
        }));

        info!(shards, queue_depth = depth, "pipeline started");
        (PipelineHandle { pipeline: self, senders, workers, tickers, shutdown }, out_rx)
    }
}

/// Stable shard for a source address. Sourceless events share shard 0.
pub fn shard_for(source: Option<&str>, shards: usize) -> usize {
    match source {
        Some(s) if shards > 1 => {
            let digest = blake3::hash(s.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest.as_bytes()[..8]);
            (u64::from_le_bytes(head) % shards as u64) as usize
        }
        _ => 0,
    }
}

pub struct PipelineHandle {
    pipeline: Arc<Pipeline>,
    senders: Vec<mpsc::Sender<Event>>,
    workers: Vec<JoinHandle<()>>,
    tickers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl PipelineHandle {
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Queue an event on its source's shard. Waits while the shard is full.
    pub async fn submit(&self, event: Event) -> Result<()> {
        let shard = shard_for(event.source(), self.senders.len());
        self.senders[shard]
            .send(event)
            .await
            .map_err(|_| PipelineError::internal(format!("shard {} is closed", shard)))
    }

    /// Drain queued events, stop the tickers and close every open session.
    pub async fn shutdown(self) -> Vec<SessionState> {
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "shard worker panicked");
            }
        }
        self.shutdown.cancel();
        for ticker in self.tickers {
            let _ = ticker.await;
        }
        let now = self.pipeline.watermark().unwrap_or_else(Utc::now);
        let closed = self.pipeline.aggregator.close_all(now).await;
        info!(closed_sessions = closed.len(), "pipeline stopped");
        closed
    }
}
