use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::core::PartialObjectMeta;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{metadata_watcher, watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        watcher::Config,
    },
    Resource,
};
use serde::Serialize;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::controllers::{Diagnostics, PullSecretConfig, State};
use crate::resources::sandboxes::Sandbox;
use crate::subjects::SubjectResolver;
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::builder::{self, binding_subjects};
use super::reconcilers::converge::{
    bounded, converge, fetch, KubeStore, ObjectKey, ObjectStore,
};
use super::reconcilers::pull_secret::reconcile_pull_secret;
use super::reconcilers::{APP_PART_OF_LABEL, OPERATOR_NAME};

/// Brings the objects derived from one Sandbox in line with it
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    subject_resolver: SubjectResolver,
    pull_secret: Option<PullSecretConfig>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        subject_resolver: SubjectResolver,
        pull_secret: Option<PullSecretConfig>,
    ) -> Self {
        Self {
            store,
            subject_resolver,
            pull_secret,
        }
    }

    /// Converge every derived object of the Sandbox `name`, stopping at the first failure.
    ///
    /// A Sandbox that no longer exists is not an error; its objects are garbage collected
    /// through their owner references.
    pub async fn reconcile(&self, name: &str) -> Result<()> {
        let store = self.store.as_ref();
        let Some(sandbox) = fetch::<Sandbox>(store, &ObjectKey::cluster(name)).await? else {
            info!("Sandbox \"{}\" no longer exists", name);
            return Ok(());
        };
        let oref = sandbox
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey("metadata.uid"))?;

        let outcome = converge(store, &oref, builder::namespace(&sandbox)).await?;
        debug!("Namespace for {}: {:?}", name, outcome);

        let outcome = converge(store, &oref, builder::resource_quota(&sandbox)).await?;
        debug!("ResourceQuota for {}: {:?}", name, outcome);

        let outcome = converge(store, &oref, builder::role(&sandbox)).await?;
        debug!("Role for {}: {:?}", name, outcome);

        let mut role_binding = builder::role_binding(&sandbox);
        role_binding.subjects =
            binding_subjects(self.subject_resolver.resolve(&sandbox.spec.owners).await?);
        let outcome = converge(store, &oref, role_binding).await?;
        debug!("RoleBinding for {}: {:?}", name, outcome);

        let outcome = converge(store, &oref, builder::cluster_role(&sandbox)).await?;
        debug!("ClusterRole for {}: {:?}", name, outcome);

        let mut cluster_role_binding = builder::cluster_role_binding(&sandbox);
        cluster_role_binding.subjects =
            binding_subjects(self.subject_resolver.resolve(&sandbox.spec.owners).await?);
        let outcome = converge(store, &oref, cluster_role_binding).await?;
        debug!("ClusterRoleBinding for {}: {:?}", name, outcome);

        if let Some(pull_secret) = &self.pull_secret {
            reconcile_pull_secret(store, &oref, &sandbox, pull_secret).await?;
        }

        Ok(())
    }
}

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Converges the derived objects
    pub reconciler: Arc<Reconciler>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Upper bound on calls made outside the store, such as publishing events
    pub request_timeout: Duration,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        let store = KubeStore::new(client.clone(), state.request_timeout);
        Arc::new(Context {
            recorder: Recorder::new(client, OPERATOR_NAME.into()),
            reconciler: Arc::new(Reconciler::new(
                Arc::new(store),
                state.subject_resolver.clone(),
                state.pull_secret.clone(),
            )),
            diagnostics: state.diagnostics.clone(),
            metrics,
            request_timeout: state.request_timeout,
        })
    }
}

#[instrument(skip(ctx, sb), fields(trace_id))]
async fn reconcile(sb: Arc<Sandbox>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure(&sb);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = sb.name_any();
    info!("Reconciling Sandbox \"{}\"", name);
    match ctx.reconciler.reconcile(&name).await {
        // nothing to do until the sandbox or one of its objects changes
        Ok(()) => Ok(Action::await_change()),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            let event = Event {
                type_: EventType::Warning,
                reason: "FailedReconcile".into(),
                note: Some(err.to_string()),
                action: "Reconcile".into(),
                secondary: None,
            };
            let reference = sb.object_ref(&());
            let publish = ctx.recorder.publish(&event, &reference);
            if let Err(publish_err) = bounded(ctx.request_timeout, publish).await {
                warn!("failed to publish reconcile event: {:?}", publish_err);
            }

            ctx.metrics.reconcile_failure(sb.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy<K, C>(_sb: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

// Namespaced children can't be related to a cluster scoped owner by `owns`, which looks the owner
// up in the child's namespace
fn sandbox_owner<K: Resource>(obj: &K) -> Option<ObjectRef<Sandbox>> {
    obj.owner_references()
        .iter()
        .find(|oref| {
            oref.controller == Some(true)
                && oref.kind == Sandbox::kind(&())
                && oref.api_version == Sandbox::api_version(&())
        })
        .map(|oref| ObjectRef::new(&oref.name))
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let sb_api = Api::<Sandbox>::all(client.clone());
    let ns_api = Api::<Namespace>::all(client.clone());
    let quota_api = Api::<ResourceQuota>::all(client.clone());
    let role_api = Api::<Role>::all(client.clone());
    let rb_api = Api::<RoleBinding>::all(client.clone());
    let crole_api = Api::<ClusterRole>::all(client.clone());
    let crb_api = Api::<ClusterRoleBinding>::all(client.clone());

    let limit_one = ListParams::default().limit(1);
    if let Err(e) = bounded(state.request_timeout, sb_api.list(&limit_one)).await {
        error!("Sandbox is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // all objects we create have this label
    let cfg = Config::default().labels(&format!("{APP_PART_OF_LABEL}={OPERATOR_NAME}"));
    // but sandboxes themselves dont
    let sb_cfg = Config::default();

    // namespace status is of no interest, only our metadata on it
    let ns_watcher = metadata_watcher(ns_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let crole_watcher = metadata_watcher(crole_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(version_predicate));

    let crb_watcher = metadata_watcher(crb_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(version_predicate));

    let quota_watcher = watcher(quota_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        // status.used moves with every pod in the namespace, so only the spec counts
        .predicate_filter(changed_predicate.combine(spec_predicate_serde));

    let role_watcher = metadata_watcher(role_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(version_predicate));

    let rb_watcher = metadata_watcher(rb_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(version_predicate));

    Controller::new(sb_api, sb_cfg)
        .shutdown_on_signal()
        .owns_stream(ns_watcher)
        .owns_stream(crole_watcher)
        .owns_stream(crb_watcher)
        .watches_stream(quota_watcher, |q: ResourceQuota| sandbox_owner(&q))
        .watches_stream(role_watcher, |r: PartialObjectMeta<Role>| sandbox_owner(&r))
        .watches_stream(rb_watcher, |rb: PartialObjectMeta<RoleBinding>| {
            sandbox_owner(&rb)
        })
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

// deletion doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    obj.owner_references()
        .iter()
        .map(|oref| &oref.uid)
        .for_each(|uid| uid.hash(&mut hasher));
    Some(hasher.finish())
}

// rbac objects have neither generation nor status, so the resourceVersion only moves when their
// rules or subjects do
fn version_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    obj.meta().resource_version.hash(&mut hasher);
    Some(hasher.finish())
}

pub trait HasSpec {
    type Spec;

    fn spec(&self) -> &Self::Spec;
}

impl HasSpec for ResourceQuota {
    type Spec = Option<ResourceQuotaSpec>;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }
}

fn spec_predicate_serde<K: Resource + HasSpec>(obj: &K) -> Option<u64>
where
    K::Spec: Serialize,
{
    let mut hasher = DefaultHasher::new();
    serde_hashkey::to_key(obj.spec()).ok()?.hash(&mut hasher);
    Some(hasher.finish())
}
