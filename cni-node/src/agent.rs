use std::sync::Arc;

use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cni::{ChainedHandler, PodContext, Server};
use crate::config::AgentArgs;
use crate::healthcheck::{LoadBalancerHealthChecker, ServiceHealthServer};
use crate::kubernetes::watch::watch_services_and_endpoint_slices;
use crate::{Error, Result, kubernetes};

/// Runs the node agent until `cancel` fires. `ready` is cancelled once the
/// caches are synced and the CNI server accepts requests.
pub async fn start(
    args: AgentArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let client = Client::try_default().await?;

    info!("syncing pods scheduled on {}", args.node_name);
    let pods =
        kubernetes::node_pod_store(client.clone(), &args.node_name, args.store_timeout()).await?;

    info!("initializing load balancer health checks");
    let (slices, writer) = reflector::store::<EndpointSlice>();
    let health_server =
        ServiceHealthServer::new(args.health_check_bind_address, cancel.child_token());
    let checker = Arc::new(LoadBalancerHealthChecker::new(
        &args.node_name,
        health_server,
        slices.clone(),
    ));
    let watch_cancel = cancel.child_token();
    let watches = tokio::spawn(async move {
        watch_services_and_endpoint_slices(client, writer, checker.as_ref(), watch_cancel).await
    });
    let synced = match args.store_timeout() {
        Some(timeout) => tokio::time::timeout(timeout, slices.wait_until_ready())
            .await
            .map_err(|_| Error::Other("timed out waiting for endpoint slices".into()))?,
        None => slices.wait_until_ready().await,
    };
    synced.map_err(|e| Error::Other(e.to_string()))?;

    info!("starting cni server");
    let mut server = Server::new(&args.cni_socket_path).with_request_timeout(args.request_timeout());
    server
        .start(
            ChainedHandler,
            PodContext {
                pods: Arc::new(pods),
                node_name: args.node_name.clone(),
            },
        )
        .await?;

    ready.cancel();
    cancel.cancelled().await;

    info!("stopping cni server");
    let out = server.stop().await;
    if let Err(e) = watches.await {
        error!(%e, "service watches did not stop cleanly");
    }
    out
}
