use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ahash::HashMap;
use async_trait::async_trait;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use cni_node_k8s_utils::NamespacedName;
use http::StatusCode;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::healthcheck::HealthServer;
use crate::http::shutdown;
use crate::{Error, Result, aggregate};

type Counts = Arc<RwLock<HashMap<NamespacedName, usize>>>;

struct Listener {
    port: u16,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Answers load balancer probes, one TCP listener per tracked service.
///
/// A probe succeeds while the service has at least one ready endpoint on
/// this node. All listeners stop once the token passed to [`Self::new`] is
/// cancelled.
pub struct ServiceHealthServer {
    address: IpAddr,
    cancel: CancellationToken,
    listeners: Mutex<HashMap<NamespacedName, Listener>>,
    counts: Counts,
}

impl ServiceHealthServer {
    pub fn new(address: IpAddr, cancel: CancellationToken) -> Self {
        Self {
            address,
            cancel,
            listeners: Mutex::new(HashMap::default()),
            counts: Arc::new(RwLock::new(HashMap::default())),
        }
    }

    async fn listen(&self, service: &NamespacedName, port: u16) -> Result<Listener> {
        let addr = SocketAddr::new(self.address, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::HealthBind {
                service: service.clone(),
                port,
                source,
            })?;
        info!("health check for service {service} listening on {addr}");

        let app = router(Arc::new(Probe {
            service: service.clone(),
            counts: self.counts.clone(),
        }));
        let cancel = self.cancel.child_token();
        let serve_cancel = cancel.clone();
        let name = service.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown(serve_cancel))
                .await
            {
                error!(%e, "health check listener for service {name} failed");
            }
        });
        Ok(Listener {
            port,
            cancel,
            handle,
        })
    }
}

#[async_trait]
impl HealthServer for ServiceHealthServer {
    async fn sync_services(&self, services: &HashMap<NamespacedName, u16>) -> Result<()> {
        let mut listeners = self.listeners.lock().await;

        let stale: Vec<NamespacedName> = listeners
            .iter()
            .filter(|(name, l)| services.get(*name) != Some(&l.port))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            let Some(listener) = listeners.remove(&name) else {
                continue;
            };
            info!("closing health check port {} for service {name}", listener.port);
            listener.cancel.cancel();
            // the port has to be free again before it can be reused
            if let Err(e) = listener.handle.await {
                warn!(%e, "health check listener for service {name} did not stop cleanly");
            }
        }

        let mut errors = vec![];
        for (name, port) in services {
            if listeners.contains_key(name) {
                continue;
            }
            match self.listen(name, *port).await {
                Ok(listener) => {
                    listeners.insert(name.clone(), listener);
                }
                Err(e) => errors.push(e),
            }
        }
        aggregate(errors)
    }

    async fn sync_endpoints(&self, endpoints: &HashMap<NamespacedName, usize>) -> Result<()> {
        *self.counts.write().await = endpoints.clone();
        Ok(())
    }
}

struct Probe {
    service: NamespacedName,
    counts: Counts,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeReply {
    service: ServiceRef,
    local_endpoints: usize,
}

#[derive(Serialize)]
struct ServiceRef {
    namespace: String,
    name: String,
}

fn router(probe: Arc<Probe>) -> Router {
    Router::new().fallback(answer_probe).with_state(probe)
}

async fn answer_probe(State(probe): State<Arc<Probe>>) -> Response {
    let count = probe
        .counts
        .read()
        .await
        .get(&probe.service)
        .copied()
        .unwrap_or(0);
    let status = if count > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let reply = ProbeReply {
        service: ServiceRef {
            namespace: probe.service.namespace.clone(),
            name: probe.service.name.clone(),
        },
        local_endpoints: count,
    };
    (status, Json(reply)).into_response()
}
