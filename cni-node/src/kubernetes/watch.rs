//! Turns raw watcher events into add/update/delete notifications.
//!
//! A watcher only reports the current state of an object. The tracker keeps
//! the last version seen per object so updates carry both sides. Objects of
//! a relist are held back until the list is complete, which is also when a
//! reflector publishes them, and objects missing from it become deletes.

use std::fmt::Debug;
use std::pin::pin;

use ahash::{HashMap, HashSet};
use async_trait::async_trait;
use cni_node_k8s_utils::NamespacedName;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::Result;
use crate::healthcheck::ServiceEventHandler;
use crate::kubernetes::endpoint_slice_config;

type EventResult<K> = std::result::Result<watcher::Event<K>, watcher::Error>;

#[derive(Debug, PartialEq)]
pub enum Notification<K> {
    Added(K),
    Updated { old: K, new: K },
    Deleted(K),
}

struct Tracker<K> {
    known: HashMap<NamespacedName, K>,
    relist: Option<Vec<K>>,
}

impl<K> Default for Tracker<K> {
    fn default() -> Self {
        Self {
            known: HashMap::default(),
            relist: None,
        }
    }
}

impl<K: ResourceExt + Clone> Tracker<K> {
    fn observe(&mut self, event: watcher::Event<K>) -> Vec<Notification<K>> {
        match event {
            watcher::Event::Apply(obj) => self.apply(obj).into_iter().collect(),
            watcher::Event::Delete(obj) => {
                self.known.remove(&NamespacedName::from_resource(&obj));
                vec![Notification::Deleted(obj)]
            }
            watcher::Event::Init => {
                self.relist = Some(vec![]);
                vec![]
            }
            watcher::Event::InitApply(obj) => match self.relist.as_mut() {
                Some(listed) => {
                    listed.push(obj);
                    vec![]
                }
                None => self.apply(obj).into_iter().collect(),
            },
            watcher::Event::InitDone => {
                let listed = self.relist.take().unwrap_or_default();
                let seen: HashSet<NamespacedName> =
                    listed.iter().map(NamespacedName::from_resource).collect();
                let gone: Vec<NamespacedName> = self
                    .known
                    .keys()
                    .filter(|k| !seen.contains(*k))
                    .cloned()
                    .collect();

                let mut notifications: Vec<_> =
                    listed.into_iter().filter_map(|obj| self.apply(obj)).collect();
                notifications.extend(
                    gone.into_iter()
                        .filter_map(|k| self.known.remove(&k))
                        .map(Notification::Deleted),
                );
                notifications
            }
        }
    }

    fn apply(&mut self, obj: K) -> Option<Notification<K>> {
        let key = NamespacedName::from_resource(&obj);
        match self.known.insert(key, obj.clone()) {
            // a relist replays objects that did not change
            Some(old) if old.resource_version().is_some()
                && old.resource_version() == obj.resource_version() =>
            {
                None
            }
            Some(old) => Some(Notification::Updated { old, new: obj }),
            None => Some(Notification::Added(obj)),
        }
    }
}

/// Delivery of one kind of notification to a [`ServiceEventHandler`].
#[async_trait]
pub trait Dispatch<K: Send + 'static> {
    async fn dispatch(&self, notification: Notification<K>) -> Result<()>;
}

#[async_trait]
impl<H: ServiceEventHandler + ?Sized> Dispatch<Service> for H {
    async fn dispatch(&self, notification: Notification<Service>) -> Result<()> {
        match notification {
            Notification::Added(svc) => self.add_service(&svc).await,
            Notification::Updated { old, new } => self.update_service(&old, &new).await,
            Notification::Deleted(svc) => self.delete_service(&svc).await,
        }
    }
}

#[async_trait]
impl<H: ServiceEventHandler + ?Sized> Dispatch<EndpointSlice> for H {
    async fn dispatch(&self, notification: Notification<EndpointSlice>) -> Result<()> {
        match notification {
            Notification::Added(slice) => self.add_endpoint_slice(&slice).await,
            Notification::Updated { old, new } => self.update_endpoint_slice(&old, &new).await,
            Notification::Deleted(slice) => self.delete_endpoint_slice(&slice).await,
        }
    }
}

/// Watches services and endpoint slices for `handler` until `cancel` fires.
///
/// Every slice event is applied to `writer` before the handler runs, so a
/// lister reading the matching store already sees the change.
pub async fn watch_services_and_endpoint_slices<H>(
    client: Client,
    writer: Writer<EndpointSlice>,
    handler: &H,
    cancel: CancellationToken,
) where
    H: ServiceEventHandler + ?Sized,
{
    let services = watcher(Api::<Service>::all(client.clone()), watcher::Config::default())
        .default_backoff();
    let slices = watcher(Api::<EndpointSlice>::all(client), endpoint_slice_config())
        .default_backoff()
        .reflect(writer);
    run_ordered(services, slices, handler, cancel).await;
}

/// Slice events only count for services that are already tracked, so the
/// slice stream is not consumed before the initial service list has been
/// handled.
async fn run_ordered<H, SS, ES>(services: SS, slices: ES, handler: &H, cancel: CancellationToken)
where
    H: ServiceEventHandler + ?Sized,
    SS: Stream<Item = EventResult<Service>>,
    ES: Stream<Item = EventResult<EndpointSlice>>,
{
    let synced = CancellationToken::new();
    let services = run("service", services, handler, cancel.clone(), Some(synced.clone()));
    let slices = async {
        select! {
            _ = cancel.cancelled() => return,
            _ = synced.cancelled() => {}
        }
        debug!("initial services handled, watching endpoint slices");
        run("endpoint slice", slices, handler, cancel.clone(), None).await;
    };
    tokio::join!(services, slices);
}

/// Dispatches every event of `stream` until it ends or `cancel` fires.
/// `synced` is cancelled once the first complete list has been handled, or
/// when the stream stops before that.
async fn run<K, S, H>(
    kind: &'static str,
    stream: S,
    handler: &H,
    cancel: CancellationToken,
    synced: Option<CancellationToken>,
) where
    K: ResourceExt + Clone + Debug + Send + 'static,
    S: Stream<Item = EventResult<K>>,
    H: Dispatch<K> + ?Sized,
{
    let mut stream = pin!(stream);
    let mut tracker = Tracker::default();
    info!("started {kind} watch");
    loop {
        let event = select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };
        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                error!(%e, "unexpected error with {kind} stream");
                continue;
            }
            None => break,
        };
        trace!("received {kind} event: {:?}", event);
        let list_done = matches!(event, watcher::Event::InitDone);
        for notification in tracker.observe(event) {
            if let Err(e) = handler.dispatch(notification).await {
                error!(%e, "failed to handle {kind} event");
            }
        }
        if list_done && let Some(synced) = &synced {
            synced.cancel();
        }
    }
    if let Some(synced) = synced {
        synced.cancel();
    }
    debug!("{kind} watch stopped");
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::stream;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions};
    use kube::api::ObjectMeta;
    use kube::runtime::reflector;

    use super::*;
    use crate::healthcheck::{HealthServer, LoadBalancerHealthChecker};

    const NODE: &str = "node1";

    fn svc(name: &str, version: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                resource_version: Some(version.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn local_svc(name: &str, port: i32) -> Service {
        let mut svc = svc(name, "1");
        svc.spec = Some(ServiceSpec {
            type_: Some("LoadBalancer".into()),
            external_traffic_policy: Some("Local".into()),
            health_check_node_port: Some(port),
            ..Default::default()
        });
        svc
    }

    fn local_slice(name: &str, service: &str, address: &str) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                resource_version: Some("1".into()),
                labels: Some(BTreeMap::from([(
                    cni_node_k8s_utils::SERVICE_OWNER_LABEL.into(),
                    service.into(),
                )])),
                ..Default::default()
            },
            address_type: "IPv4".into(),
            endpoints: vec![Endpoint {
                addresses: vec![address.into()],
                node_name: Some(NODE.into()),
                conditions: Some(EndpointConditions {
                    ready: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn listed<K>(objects: Vec<K>) -> Vec<EventResult<K>> {
        let mut events = vec![Ok(watcher::Event::Init)];
        events.extend(objects.into_iter().map(|o| Ok(watcher::Event::InitApply(o))));
        events.push(Ok(watcher::Event::InitDone));
        events
    }

    #[test]
    fn test_apply_and_delete() {
        let mut tracker = Tracker::default();

        let added = tracker.observe(watcher::Event::Apply(svc("a", "1")));
        assert_eq!(added, vec![Notification::Added(svc("a", "1"))]);

        let updated = tracker.observe(watcher::Event::Apply(svc("a", "2")));
        assert_eq!(
            updated,
            vec![Notification::Updated {
                old: svc("a", "1"),
                new: svc("a", "2")
            }]
        );

        let deleted = tracker.observe(watcher::Event::Delete(svc("a", "2")));
        assert_eq!(deleted, vec![Notification::Deleted(svc("a", "2"))]);
        assert!(tracker.known.is_empty());
    }

    #[test]
    fn test_relist_is_delivered_when_complete() {
        let mut tracker = Tracker::default();
        tracker.observe(watcher::Event::Apply(svc("a", "1")));
        tracker.observe(watcher::Event::Apply(svc("b", "1")));

        assert!(tracker.observe(watcher::Event::Init).is_empty());
        assert!(
            tracker
                .observe(watcher::Event::InitApply(svc("a", "1")))
                .is_empty()
        );
        assert!(
            tracker
                .observe(watcher::Event::InitApply(svc("c", "1")))
                .is_empty()
        );
        // unchanged "a" is dropped, "b" is gone
        assert_eq!(
            tracker.observe(watcher::Event::InitDone),
            vec![
                Notification::Added(svc("c", "1")),
                Notification::Deleted(svc("b", "1"))
            ]
        );
        assert_eq!(tracker.known.len(), 2);
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ServiceEventHandler for Recorder {
        async fn add_service(&self, svc: &Service) -> Result<()> {
            self.calls.lock().unwrap().push(format!("add {}", svc.name_any()));
            Ok(())
        }

        async fn update_service(&self, _old: &Service, new: &Service) -> Result<()> {
            self.calls.lock().unwrap().push(format!("update {}", new.name_any()));
            Err(crate::Error::Other("rejected".into()))
        }

        async fn delete_service(&self, svc: &Service) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete {}", svc.name_any()));
            Ok(())
        }

        async fn add_endpoint_slice(&self, slice: &EndpointSlice) -> Result<()> {
            self.calls.lock().unwrap().push(format!("add slice {}", slice.name_any()));
            Ok(())
        }

        async fn update_endpoint_slice(
            &self,
            _old: &EndpointSlice,
            new: &EndpointSlice,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(format!("update slice {}", new.name_any()));
            Ok(())
        }

        async fn delete_endpoint_slice(&self, slice: &EndpointSlice) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete slice {}", slice.name_any()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_dispatches_and_survives_errors() {
        let events: Vec<EventResult<Service>> = vec![
            Ok(watcher::Event::Apply(svc("a", "1"))),
            Ok(watcher::Event::Apply(svc("a", "2"))),
            Ok(watcher::Event::Delete(svc("a", "2"))),
        ];
        let recorder = Recorder::default();
        let synced = CancellationToken::new();
        run(
            "service",
            stream::iter(events),
            &recorder,
            CancellationToken::new(),
            Some(synced.clone()),
        )
        .await;

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["add a", "update a", "delete a"]
        );
        // the stream ended without a list, waiters are released anyway
        assert!(synced.is_cancelled());
    }

    #[tokio::test]
    async fn test_slices_wait_for_initial_services() {
        // the service list arrives slowly, the slice list is ready at once
        let services = stream::iter(listed(vec![svc("a", "1")])).then(|e| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            e
        });
        let slices = stream::iter(listed(vec![local_slice("a-1", "a", "10.0.0.1")]));
        let recorder = Recorder::default();

        run_ordered(services, slices, &recorder, CancellationToken::new()).await;
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["add a", "add slice a-1"]);
    }

    #[derive(Clone, Default)]
    struct RecordingHealthServer {
        endpoints: Arc<Mutex<Vec<ahash::HashMap<NamespacedName, usize>>>>,
    }

    #[async_trait]
    impl HealthServer for RecordingHealthServer {
        async fn sync_services(&self, _services: &ahash::HashMap<NamespacedName, u16>) -> Result<()> {
            Ok(())
        }

        async fn sync_endpoints(&self, endpoints: &ahash::HashMap<NamespacedName, usize>) -> Result<()> {
            self.endpoints.lock().unwrap().push(endpoints.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_initial_lists_populate_endpoint_table() {
        let (store, writer) = reflector::store::<EndpointSlice>();
        let server = RecordingHealthServer::default();
        let checker = LoadBalancerHealthChecker::new(NODE, server.clone(), store.clone());

        let services = stream::iter(listed(vec![local_svc("web", 30001)])).then(|e| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            e
        });
        let slices = stream::iter(listed(vec![
            local_slice("web-1", "web", "10.0.0.1"),
            local_slice("web-2", "web", "10.0.0.2"),
        ]))
        .reflect(writer);

        run_ordered(services, slices, &checker, CancellationToken::new()).await;

        assert_eq!(store.state().len(), 2);
        let pushes = server.endpoints.lock().unwrap();
        let last = pushes.last().expect("endpoint table was never pushed");
        assert_eq!(last.get(&NamespacedName::new("default", "web")), Some(&2));
    }
}
