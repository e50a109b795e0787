use std::sync::Arc;

use ahash::{HashMap, HashSet};
use async_trait::async_trait;
use cni_node_k8s_utils::{EndpointSliceLister, NamespacedName, service_namespaced_name};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointSlice};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::healthcheck::{HealthServer, ServiceEventHandler};
use crate::metrics::HEALTH_CHECK_METRICS;
use crate::{Error, Result, aggregate};

const TRAFFIC_POLICY_LOCAL: &str = "Local";

#[derive(Default)]
struct Tables {
    services: HashMap<NamespacedName, u16>,
    // keys are always a subset of `services`
    endpoints: HashMap<NamespacedName, usize>,
}

/// Keeps the health server in line with the services that route external
/// traffic to node local endpoints only.
///
/// Every operation takes the table lock for its whole duration, including
/// the push to the health server, so pushes are never reordered against the
/// table changes that caused them.
pub struct LoadBalancerHealthChecker<S, L> {
    node_name: String,
    server: S,
    lister: L,
    tables: Mutex<Tables>,
}

impl<S, L> LoadBalancerHealthChecker<S, L>
where
    S: HealthServer,
    L: EndpointSliceLister,
{
    pub fn new(node_name: impl Into<String>, server: S, lister: L) -> Self {
        Self {
            node_name: node_name.into(),
            server,
            lister,
            tables: Mutex::new(Tables::default()),
        }
    }

    async fn add_service_locked(&self, tables: &mut Tables, svc: &Service) -> Result<()> {
        let port = health_check_port(svc);
        if port == 0 {
            return Ok(());
        }
        let name = NamespacedName::from_resource(svc);
        info!("tracking health check port {port} for service {name}");
        tables.services.insert(name, port);
        self.push_services(tables).await
    }

    async fn delete_service_locked(&self, tables: &mut Tables, svc: &Service) -> Result<()> {
        if health_check_port(svc) == 0 {
            return Ok(());
        }
        let name = NamespacedName::from_resource(svc);
        info!("removing health check for service {name}");
        tables.services.remove(&name);
        tables.endpoints.remove(&name);
        self.push_services(tables).await
    }

    /// Recomputes the local endpoint count of the service owning `slice`
    /// from every slice of that service currently in the cache.
    async fn sync_endpoint_slices(&self, slice: &EndpointSlice) -> Result<()> {
        let service = service_namespaced_name(slice).map_err(|source| Error::SliceOwner {
            slice: NamespacedName::from_resource(slice),
            source,
        })?;

        let mut tables = self.tables.lock().await;
        if !tables.services.contains_key(&service) {
            trace!("service {service} has no health check, ignoring slice");
            return Ok(());
        }
        let slices = self.fetch_slices(&service)?;
        if slices.is_empty() {
            debug!("no endpoint slices left for service {service}");
            tables.endpoints.remove(&service);
        } else {
            let count = count_local_ready_endpoint_addresses(&self.node_name, &slices);
            debug!("service {service} has {count} local ready endpoints");
            tables.endpoints.insert(service, count);
        }
        self.push_endpoints(&tables).await
    }

    fn fetch_slices(&self, service: &NamespacedName) -> Result<Vec<Arc<EndpointSlice>>> {
        self.lister
            .get_endpoint_slices(&service.namespace, &service.name)
            .map_err(|source| Error::CacheFetch {
                service: service.clone(),
                source,
            })
    }

    async fn push_services(&self, tables: &Tables) -> Result<()> {
        let out = self.server.sync_services(&tables.services).await;
        HEALTH_CHECK_METRICS.count_sync("services", out.as_ref().err());
        HEALTH_CHECK_METRICS
            .services
            .set(i64::try_from(tables.services.len()).unwrap_or(i64::MAX));
        out
    }

    async fn push_endpoints(&self, tables: &Tables) -> Result<()> {
        let out = self.server.sync_endpoints(&tables.endpoints).await;
        HEALTH_CHECK_METRICS.count_sync("endpoints", out.as_ref().err());
        out
    }
}

#[async_trait]
impl<S, L> ServiceEventHandler for LoadBalancerHealthChecker<S, L>
where
    S: HealthServer,
    L: EndpointSliceLister,
{
    async fn add_service(&self, svc: &Service) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.add_service_locked(&mut tables, svc).await
    }

    /// Only a change of the external traffic policy between Cluster and
    /// Local is acted upon.
    async fn update_service(&self, old: &Service, new: &Service) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let mut errors = vec![];
        match (is_local(old), is_local(new)) {
            (false, true) => {
                if let Err(e) = self.add_service_locked(&mut tables, new).await {
                    errors.push(e);
                }
                let name = NamespacedName::from_resource(new);
                match self.fetch_slices(&name) {
                    Ok(slices) if tables.services.contains_key(&name) => {
                        let count = count_local_ready_endpoint_addresses(&self.node_name, &slices);
                        tables.endpoints.insert(name, count);
                        if let Err(e) = self.push_endpoints(&tables).await {
                            errors.push(e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => errors.push(e),
                }
            }
            (true, false) => {
                if let Err(e) = self.delete_service_locked(&mut tables, old).await {
                    errors.push(e);
                }
            }
            _ => {}
        }
        aggregate(errors)
    }

    async fn delete_service(&self, svc: &Service) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.delete_service_locked(&mut tables, svc).await
    }

    async fn add_endpoint_slice(&self, slice: &EndpointSlice) -> Result<()> {
        self.sync_endpoint_slices(slice).await
    }

    async fn update_endpoint_slice(&self, _old: &EndpointSlice, new: &EndpointSlice) -> Result<()> {
        self.sync_endpoint_slices(new).await
    }

    async fn delete_endpoint_slice(&self, slice: &EndpointSlice) -> Result<()> {
        self.sync_endpoint_slices(slice).await
    }
}

/// Number of distinct addresses of ready endpoints scheduled on `node_name`.
///
/// Readiness alone decides: a terminating endpoint that is still ready is
/// counted, a serving one that is not ready is not.
pub fn count_local_ready_endpoint_addresses(node_name: &str, slices: &[Arc<EndpointSlice>]) -> usize {
    let mut addresses = HashSet::default();
    for endpoint in slices.iter().flat_map(|s| s.endpoints.iter()) {
        if endpoint.node_name.as_deref() == Some(node_name) && is_ready(endpoint) {
            addresses.extend(endpoint.addresses.iter().map(String::as_str));
        }
    }
    addresses.len()
}

fn is_ready(endpoint: &Endpoint) -> bool {
    endpoint
        .conditions
        .as_ref()
        .and_then(|c| c.ready)
        .unwrap_or(true)
}

fn is_local(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.external_traffic_policy.as_deref())
        == Some(TRAFFIC_POLICY_LOCAL)
}

// out of range ports are treated as unset
fn health_check_port(svc: &Service) -> u16 {
    svc.spec
        .as_ref()
        .and_then(|s| s.health_check_node_port)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(0)
}
