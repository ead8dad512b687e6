//! Domain-oriented publishing façade.
//!
//! Each helper builds a well-formed event for one kind, persists it to the
//! event log first (failure is logged and counted, never fatal), then hands
//! it to the bus.  Only the bus error surfaces to the caller.

use std::sync::Arc;

use tracing::warn;
use ve_protocol::{Event, EventKind, Severity};

use crate::bus::{EventBus, PublishError, normalize_event, validate_event};
use crate::metrics::BusMetrics;
use crate::store::EventSink;

pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    bus: EventBus,
    metrics: Arc<BusMetrics>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, bus: EventBus) -> Self {
        let metrics = bus.metrics_handle();
        EventPublisher { sink, bus, metrics }
    }

    /// Persist first, then enqueue for live fan-out.
    ///
    /// A store failure does not abort: the live path is best effort and the
    /// caller learns only about bus-level failures (`BufferFull`,
    /// `ShuttingDown`, `InvalidEvent`).
    pub fn publish_and_store(&self, mut event: Event) -> Result<(), PublishError> {
        validate_event(&event)?;
        normalize_event(&mut event);
        if let Err(e) = self.sink.store(&event) {
            self.metrics.record_persist_error();
            warn!(
                event_id = %event.id,
                error = %e,
                "failed to persist event; live fan-out proceeds"
            );
        }
        self.bus.publish(event)
    }

    // -----------------------------------------------------------------------
    // Verification lifecycle
    // -----------------------------------------------------------------------

    pub fn publish_verification_started(
        &self,
        model_id: &str,
        verification_id: &str,
    ) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::VerificationStarted,
                Severity::Info,
                "Verification started",
                format!("verification {verification_id} started for model {model_id}"),
            )
            .with_model(model_id)
            .with_verification(verification_id)
            .with_source("verifier"),
        )
    }

    pub fn publish_verification_completed(
        &self,
        model_id: &str,
        verification_id: &str,
        checks_passed: u32,
        checks_total: u32,
    ) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::VerificationCompleted,
                Severity::Info,
                "Verification completed",
                format!(
                    "verification {verification_id} for model {model_id}: \
                     {checks_passed}/{checks_total} checks passed"
                ),
            )
            .with_model(model_id)
            .with_verification(verification_id)
            .with_detail("checks_passed", checks_passed)
            .with_detail("checks_total", checks_total)
            .with_source("verifier"),
        )
    }

    pub fn publish_verification_failed(
        &self,
        model_id: &str,
        verification_id: &str,
        reason: &str,
    ) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::VerificationFailed,
                Severity::Error,
                "Verification failed",
                format!("verification {verification_id} for model {model_id} failed: {reason}"),
            )
            .with_model(model_id)
            .with_verification(verification_id)
            .with_detail("reason", reason)
            .with_source("verifier"),
        )
    }

    // -----------------------------------------------------------------------
    // Scores
    // -----------------------------------------------------------------------

    /// No-op when the score did not actually change.
    pub fn publish_score_changed(
        &self,
        model_id: &str,
        old_score: f64,
        new_score: f64,
        score_kind: &str,
    ) -> Result<(), PublishError> {
        if (old_score - new_score).abs() < f64::EPSILON {
            return Ok(());
        }
        self.publish_and_store(
            Event::new(
                EventKind::ScoreChanged,
                Severity::Info,
                "Score changed",
                format!(
                    "model {model_id} {score_kind} score changed from {old_score} to {new_score}"
                ),
            )
            .with_model(model_id)
            .with_detail("score_kind", score_kind)
            .with_detail("old_score", old_score)
            .with_detail("new_score", new_score)
            .with_source("scoring"),
        )
    }

    // -----------------------------------------------------------------------
    // Catalog changes
    // -----------------------------------------------------------------------

    pub fn publish_model_added(
        &self,
        model_id: &str,
        provider_id: &str,
    ) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::ModelAdded,
                Severity::Info,
                "Model added",
                format!("model {model_id} added under provider {provider_id}"),
            )
            .with_model(model_id)
            .with_provider(provider_id)
            .with_source("catalog"),
        )
    }

    pub fn publish_model_removed(&self, model_id: &str) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::ModelRemoved,
                Severity::Info,
                "Model removed",
                format!("model {model_id} removed"),
            )
            .with_model(model_id)
            .with_source("catalog"),
        )
    }

    pub fn publish_provider_added(&self, provider_id: &str) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::ProviderAdded,
                Severity::Info,
                "Provider added",
                format!("provider {provider_id} added"),
            )
            .with_provider(provider_id)
            .with_source("catalog"),
        )
    }

    pub fn publish_provider_removed(&self, provider_id: &str) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::ProviderRemoved,
                Severity::Info,
                "Provider removed",
                format!("provider {provider_id} removed"),
            )
            .with_provider(provider_id)
            .with_source("catalog"),
        )
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    pub fn publish_issue_detected(
        &self,
        issue_id: &str,
        model_id: Option<&str>,
        description: &str,
    ) -> Result<(), PublishError> {
        let mut event = Event::new(
            EventKind::IssueDetected,
            Severity::Error,
            "Issue detected",
            description,
        )
        .with_issue(issue_id)
        .with_source("monitor");
        if let Some(model_id) = model_id {
            event = event.with_model(model_id);
        }
        self.publish_and_store(event)
    }

    pub fn publish_issue_resolved(
        &self,
        issue_id: &str,
        resolution: &str,
    ) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::IssueResolved,
                Severity::Info,
                "Issue resolved",
                format!("issue {issue_id} resolved: {resolution}"),
            )
            .with_issue(issue_id)
            .with_source("monitor"),
        )
    }

    // -----------------------------------------------------------------------
    // Operational events
    // -----------------------------------------------------------------------

    pub fn publish_config_exported(
        &self,
        user_id: &str,
        destination: &str,
    ) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::ConfigExported,
                Severity::Info,
                "Configuration exported",
                format!("configuration exported to {destination}"),
            )
            .with_user(user_id)
            .with_detail("destination", destination)
            .with_source("config"),
        )
    }

    pub fn publish_client_connected(
        &self,
        client_id: &str,
        transport: &str,
    ) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::ClientConnected,
                Severity::Debug,
                "Client connected",
                format!("{transport} client {client_id} connected"),
            )
            .with_client(client_id)
            .with_detail("transport", transport)
            .with_source("gateway"),
        )
    }

    pub fn publish_client_disconnected(
        &self,
        client_id: &str,
        transport: &str,
    ) -> Result<(), PublishError> {
        self.publish_and_store(
            Event::new(
                EventKind::ClientDisconnected,
                Severity::Debug,
                "Client disconnected",
                format!("{transport} client {client_id} disconnected"),
            )
            .with_client(client_id)
            .with_detail("transport", transport)
            .with_source("gateway"),
        )
    }

    pub fn publish_system_health_changed(
        &self,
        component: &str,
        healthy: bool,
        detail: &str,
    ) -> Result<(), PublishError> {
        let severity = if healthy {
            Severity::Info
        } else {
            Severity::Warning
        };
        self.publish_and_store(
            Event::new(
                EventKind::SystemHealthChanged,
                severity,
                "System health changed",
                format!("{component} is now {}: {detail}", if healthy { "healthy" } else { "degraded" }),
            )
            .with_detail("component", component)
            .with_detail("healthy", healthy)
            .with_source("monitor"),
        )
    }

    pub fn publish_security_alert(
        &self,
        title: &str,
        message: &str,
        user_id: Option<&str>,
    ) -> Result<(), PublishError> {
        let mut event = Event::new(EventKind::SecurityAlert, Severity::Critical, title, message)
            .with_source("security");
        if let Some(user_id) = user_id {
            event = event.with_user(user_id);
        }
        self.publish_and_store(event)
    }
}
