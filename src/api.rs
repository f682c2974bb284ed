//! Alert record operations exposed at the service boundary.
//!
//! Transport and authentication live outside this crate; callers arrive here
//! already identified with a role.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use validator::Validate;

use crate::alerting::{AlertCandidate, AlertEngine, Raised};
use crate::error::{PipelineError, Result};
use crate::models::{Alert, AlertSourceKind, AlertStatus, ChannelTarget, NotificationAttempt, Severity};
use crate::notify::Dispatcher;
use crate::pipeline::Pipeline;
use crate::store::{AlertFilter, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Analyst,
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    fn require_writer(&self) -> Result<()> {
        match self.role {
            Role::Admin | Role::Analyst => Ok(()),
            Role::Viewer => Err(PipelineError::authorization(format!("'{}' may not modify alerts", self.id))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateAlertRequest {
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    pub severity: Severity,
    #[serde(default)]
    pub source_address: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

pub struct AlertApi {
    store: Arc<dyn Store>,
    engine: Arc<AlertEngine>,
    dispatcher: Arc<Dispatcher>,
}

impl AlertApi {
    pub fn new(store: Arc<dyn Store>, engine: Arc<AlertEngine>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, engine, dispatcher }
    }

    pub fn for_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(pipeline.store().clone(), pipeline.engine().clone(), pipeline.dispatcher().clone())
    }

    /// Newest first.
    pub async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        self.store.list_alerts(filter).await
    }

    pub async fn get_alert(&self, alert_id: &str) -> Result<Alert> {
        self.store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("alert '{}'", alert_id)))
    }

    /// Manually raised alert. Goes through the same suppression as generated ones,
    /// scoped per caller and source.
    pub async fn create_alert(&self, caller: &Caller, request: CreateAlertRequest, now: DateTime<Utc>) -> Result<Raised> {
        caller.require_writer()?;
        request.validate().map_err(|e| PipelineError::validation(e.to_string()))?;
        let mut metadata = request.metadata;
        metadata.insert("created_by".into(), Value::String(caller.id.clone()));
        let candidate = AlertCandidate {
            title: request.title,
            severity: request.severity,
            source_kind: AlertSourceKind::System,
            alert_rule: format!("manual:{}", caller.id),
            source_address: request.source_address,
            event_id: None,
            metadata,
            trigger_key: None,
        };
        let raised = self.engine.raise(candidate, now).await?;
        if let Raised::Created(alert) = &raised {
            info!(alert_id = %alert.id, actor = %caller.id, "manual alert created");
        }
        Ok(raised)
    }

    pub async fn update_status(
        &self,
        caller: &Caller,
        alert_id: &str,
        status: AlertStatus,
        now: DateTime<Utc>,
    ) -> Result<Alert> {
        caller.require_writer()?;
        match status {
            AlertStatus::Acknowledged => self.engine.acknowledge(alert_id, &caller.id, now).await,
            AlertStatus::Resolved => self.engine.resolve(alert_id, &caller.id, now).await,
            AlertStatus::New => Err(PipelineError::InvalidTransition(format!(
                "alert '{}' cannot move back to new",
                alert_id
            ))),
        }
    }

    pub async fn acknowledge(&self, caller: &Caller, alert_id: &str, now: DateTime<Utc>) -> Result<Alert> {
        self.update_status(caller, alert_id, AlertStatus::Acknowledged, now).await
    }

    pub async fn resolve(&self, caller: &Caller, alert_id: &str, now: DateTime<Utc>) -> Result<Alert> {
        self.update_status(caller, alert_id, AlertStatus::Resolved, now).await
    }

    /// Send a synthetic alert to one channel. Admins only. Nothing is written
    /// to the alert table; the attempt is logged like any other.
    pub async fn test_channel(&self, caller: &Caller, channel: &ChannelTarget, now: DateTime<Utc>) -> Result<NotificationAttempt> {
        if caller.role != Role::Admin {
            return Err(PipelineError::authorization(format!("'{}' may not test notification channels", caller.id)));
        }
        let mut metadata = Map::new();
        metadata.insert("test".into(), Value::Bool(true));
        metadata.insert("requested_by".into(), Value::String(caller.id.clone()));
        let alert = Alert {
            id: format!("test-{}", uuid::Uuid::new_v4()),
            title: format!("Test notification for {}", channel.id),
            severity: Severity::Low,
            status: AlertStatus::New,
            source_kind: AlertSourceKind::System,
            alert_rule: None,
            source_address: None,
            event_id: None,
            metadata,
            created_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
        };
        Ok(self.dispatcher.deliver(&alert, channel, false).await)
    }
}
