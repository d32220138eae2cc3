use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryFutureExt};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        events::Reporter,
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    ResourceExt,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::*;

use crate::api::{
    backup_bucket::BackupBucket, deployment_binding::DeploymentBinding, fleet_member::FleetMember,
    registration::Registration,
};
use crate::config::ControllerConfig;
use crate::controllers::{
    binding::BindingDispatcher, controller::Context, fleet_member, helm::render::HelmRenderer,
    registration,
};
use crate::member::KubeMemberClientFactory;
use crate::predicates::{binding_changed, targets_member};
use crate::recorder::KubeRecorder;
use crate::runtime::{Driver, WorkQueue};
use crate::store::{CachedStore, KubeStore, Stores, StoredObject};
use crate::{Error, Metrics, Result};

pub static MEMBER_CONTROLLER: &str = "fleet-member";
pub static REGISTRATION_CONTROLLER: &str = "registration";
pub static BINDING_CONTROLLER: &str = "deployment-binding";

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
    /// Workers inside a reconcile, per controller
    pub running_workers: BTreeMap<String, i64>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "fleet-extension-manager".into(),
            running_workers: BTreeMap::new(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    metrics: Metrics,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new() -> Result<Self> {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default().register(&registry)?;
        Ok(Self {
            diagnostics: Default::default(),
            registry,
            metrics,
        })
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = self.diagnostics.read().await.clone();
        diagnostics.running_workers = [MEMBER_CONTROLLER, REGISTRATION_CONTROLLER, BINDING_CONTROLLER]
            .into_iter()
            .map(|controller| (controller.to_string(), self.metrics.running_workers(controller)))
            .collect();
        diagnostics
    }
}

/// Mirrors `api` into the cache behind `writer` and queues the name of every
/// object `relevant` accepts. `relevant` sees the cached copy, if any, before
/// the event is applied.
async fn reflect<K>(
    api: Api<K>,
    mut writer: Writer<K>,
    reader: Store<K>,
    queue: WorkQueue,
    relevant: impl Fn(Option<&K>, &K) -> bool + Send + 'static,
) where
    K: StoredObject,
{
    let mut events = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!("Watch failed: {err}");
                continue;
            }
        };

        let changed = match &event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                let cached = reader.get(&ObjectRef::from_obj(obj));
                relevant(cached.as_deref(), obj).then(|| obj.name_any())
            }
            watcher::Event::Delete(obj) => relevant(None, obj).then(|| obj.name_any()),
            watcher::Event::Init | watcher::Event::InitDone => None,
        };

        writer.apply_watcher_event(&event);
        if let Some(name) = changed {
            queue.add(&name);
        }
    }
}

fn live_and_cached<K: StoredObject>(api: Api<K>, reader: Store<K>) -> Stores<K> {
    Stores::new(
        Arc::new(CachedStore::new(reader, api.clone())),
        Arc::new(KubeStore::new(api)),
    )
}

/// Initialize the controllers and shared state (given the crds are installed)
pub async fn run(state: State, config: ControllerConfig) -> Result<()> {
    let client = Client::try_default().await?;
    let members = Api::<FleetMember>::all(client.clone());
    let registrations = Api::<Registration>::all(client.clone());
    let bindings = Api::<DeploymentBinding>::all(client.clone());
    let buckets = Api::<BackupBucket>::all(client.clone());

    if let Err(e) = bindings.list(&ListParams::default().limit(1)).await {
        error!("DeploymentBindings are not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }

    let member_queue = WorkQueue::default();
    let registration_queue = WorkQueue::default();
    let binding_queue = WorkQueue::default();

    let (member_reader, member_writer) = reflector::store();
    let (registration_reader, registration_writer) = reflector::store();
    let (binding_reader, binding_writer) = reflector::store();

    let member_name = config.member_name.clone();
    let watchers = [
        tokio::spawn(reflect(
            members.clone(),
            member_writer,
            member_reader.clone(),
            member_queue.clone(),
            |_, _| true,
        )),
        tokio::spawn(reflect(
            registrations.clone(),
            registration_writer,
            registration_reader.clone(),
            registration_queue.clone(),
            |_, _| true,
        )),
        tokio::spawn(reflect(
            bindings.clone(),
            binding_writer,
            binding_reader.clone(),
            binding_queue.clone(),
            move |old, new| targets_member(new, member_name.as_deref()) && binding_changed(old, new),
        )),
    ];

    tokio::try_join!(
        member_reader.wait_until_ready(),
        registration_reader.wait_until_ready(),
        binding_reader.wait_until_ready(),
    )?;
    info!("Caches synced");

    let reporter = state.diagnostics.read().await.reporter.clone();
    let ctx = Arc::new(Context {
        members: live_and_cached(members, member_reader),
        registrations: live_and_cached(registrations, registration_reader),
        bindings: live_and_cached(bindings, binding_reader),
        backup_buckets: Arc::new(KubeStore::new(buckets)),
        member_clients: Arc::new(KubeMemberClientFactory::new(client.clone())),
        renderer: Arc::new(HelmRenderer::default()),
        recorder: Arc::new(KubeRecorder::new(client, reporter)),
        registration_queue: registration_queue.clone(),
        diagnostics: state.diagnostics.clone(),
        config: config.reconcile_config(),
    });

    let shutdown_poll = config.shutdown_poll();
    let member_driver = Driver::new(MEMBER_CONTROLLER, member_queue, shutdown_poll, state.metrics.clone());
    let registration_driver = Driver::new(
        REGISTRATION_CONTROLLER,
        registration_queue,
        shutdown_poll,
        state.metrics.clone(),
    );
    let binding_driver = Driver::new(BINDING_CONTROLLER, binding_queue, shutdown_poll, state.metrics.clone());

    let members = member_driver.run(config.member_workers, {
        let ctx = ctx.clone();
        move |name| fleet_member::reconcile(name, ctx.clone()).map_err(Error::from)
    });
    let registrations = registration_driver.run(config.registration_workers, {
        let ctx = ctx.clone();
        move |name| registration::reconcile(name, ctx.clone()).map_err(Error::from)
    });
    let bindings = binding_driver.run(config.binding_workers, {
        let dispatcher = Arc::new(BindingDispatcher::default());
        move |name| {
            let dispatcher = dispatcher.clone();
            let ctx = ctx.clone();
            async move { dispatcher.dispatch(name, ctx).await.map_err(Error::from) }
        }
    });

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {err}");
        }
        info!("Shutting down controllers");
        tokio::join!(
            member_driver.shutdown(),
            registration_driver.shutdown(),
            binding_driver.shutdown()
        );
    };

    tokio::join!(members, registrations, bindings, shutdown);
    for watcher in watchers {
        watcher.abort();
    }
    Ok(())
}
