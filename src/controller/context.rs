//! Shared context passed to every reconciliation.

use std::sync::Arc;

use kube::Client;
use kube::runtime::events::{Recorder, Reporter};

use crate::controller::registration::{OpenRegistration, Registration};
use crate::health::HealthState;
use crate::naming::Naming;

/// Context shared by all reconcile invocations. Everything here is immutable
/// or internally synchronized; per-upgrade state never lives in the context.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event recorder for user-visible warnings
    pub recorder: Recorder,
    /// Registration gate consulted before any upgrade starts
    pub registration: Arc<dyn Registration>,
    /// Label and naming scheme for generated and observed objects
    pub naming: Naming,
    /// Health/metrics state, absent in tests
    pub health: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(client: Client, health: Option<Arc<HealthState>>) -> Self {
        let reporter = Reporter {
            controller: "postgres-upgrade-operator".into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            registration: Arc::new(OpenRegistration),
            naming: Naming::default(),
            health,
        }
    }

    /// Replaces the registration gate, e.g. with a token validator.
    pub fn with_registration(mut self, registration: Arc<dyn Registration>) -> Self {
        self.registration = registration;
        self
    }
}
