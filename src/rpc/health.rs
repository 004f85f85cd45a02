//! gRPC health responder.

use std::sync::Arc;

use tokio::sync::watch;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

/// Serving state of the whole server (the empty service name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    Unknown,
    Serving,
    NotServing,
}

impl ServingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingState::Unknown => "unknown",
            ServingState::Serving => "serving",
            ServingState::NotServing => "not_serving",
        }
    }
}

impl From<ServingState> for ServingStatus {
    fn from(state: ServingState) -> Self {
        match state {
            ServingState::Unknown => ServingStatus::Unknown,
            ServingState::Serving => ServingStatus::Serving,
            ServingState::NotServing => ServingStatus::NotServing,
        }
    }
}

/// Shared handle onto the `grpc.health.v1.Health` service of one RPC server.
///
/// The overall state is mirrored locally so in-process readers (the internal
/// HTTP `/healthz`) do not need an RPC round trip.
#[derive(Clone)]
pub struct HealthResponder {
    reporter: HealthReporter,
    state: Arc<watch::Sender<ServingState>>,
}

impl HealthResponder {
    /// Wrap a reporter. tonic's reporter starts out serving.
    pub(crate) fn new(reporter: HealthReporter) -> Self {
        let (state, _) = watch::channel(ServingState::Serving);
        Self {
            reporter,
            state: Arc::new(state),
        }
    }

    pub async fn set_serving(&self) {
        self.set_state(ServingState::Serving).await;
    }

    pub async fn set_not_serving(&self) {
        self.set_state(ServingState::NotServing).await;
    }

    /// Set the overall state.
    pub async fn set_state(&self, state: ServingState) {
        self.reporter.set_service_status("", state.into()).await;
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = previous.as_str(), to = state.as_str(), "Health state changed");
        }
    }

    /// Set the state of one named service.
    pub async fn set_service_state(&self, service: &str, state: ServingState) {
        self.reporter.set_service_status(service, state.into()).await;
    }

    /// Current overall state.
    pub fn state(&self) -> ServingState {
        *self.state.borrow()
    }

    /// Watch the overall state.
    pub fn subscribe(&self) -> watch::Receiver<ServingState> {
        self.state.subscribe()
    }
}

impl std::fmt::Debug for HealthResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthResponder")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirrors_overall_state() {
        let (reporter, _service) = tonic_health::server::health_reporter();
        let health = HealthResponder::new(reporter);
        let mut updates = health.subscribe();
        assert_eq!(health.state(), ServingState::Serving);

        health.set_not_serving().await;
        assert_eq!(health.state(), ServingState::NotServing);
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), ServingState::NotServing);

        health.set_serving().await;
        assert_eq!(health.state(), ServingState::Serving);
    }
}
