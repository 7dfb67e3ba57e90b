use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::subjects::SubjectResolver;

pub mod sandbox;

pub use sandbox::reconcilers::pull_secret::PullSecretConfig;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub subject_resolver: &'static str,
}

impl Diagnostics {
    fn new(subject_resolver: &'static str) -> Self {
        Self {
            last_event: Utc::now(),
            subject_resolver,
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// How owners are turned into binding subjects, fixed for the life of the process
    subject_resolver: SubjectResolver,
    /// If set, copy this image pull secret into every sandbox namespace
    pull_secret: Option<PullSecretConfig>,
    /// Upper bound on every call made to the cluster
    request_timeout: Duration,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(
        subject_resolver: SubjectResolver,
        pull_secret: Option<PullSecretConfig>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(subject_resolver.name()))),
            registry: prometheus::Registry::default(),
            subject_resolver,
            pull_secret,
            request_timeout,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
