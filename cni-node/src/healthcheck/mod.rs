//! Load balancer health checks for services with a node local external
//! traffic policy.

mod checker;
mod server;

use ahash::HashMap;
use async_trait::async_trait;
use cni_node_k8s_utils::NamespacedName;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;

use crate::Result;

pub use checker::{LoadBalancerHealthChecker, count_local_ready_endpoint_addresses};
pub use server::ServiceHealthServer;

/// Receives the full desired tables after every change.
///
/// Implementations reconcile their listeners against the table they are
/// given; entries missing from a table are to be torn down.
#[async_trait]
pub trait HealthServer: Send + Sync {
    async fn sync_services(&self, services: &HashMap<NamespacedName, u16>) -> Result<()>;
    async fn sync_endpoints(&self, endpoints: &HashMap<NamespacedName, usize>) -> Result<()>;
}

/// Object cache notifications for services and their endpoint slices.
#[async_trait]
pub trait ServiceEventHandler: Send + Sync {
    async fn add_service(&self, svc: &Service) -> Result<()>;
    async fn update_service(&self, old: &Service, new: &Service) -> Result<()>;
    async fn delete_service(&self, svc: &Service) -> Result<()>;

    async fn add_endpoint_slice(&self, slice: &EndpointSlice) -> Result<()>;
    async fn update_endpoint_slice(&self, old: &EndpointSlice, new: &EndpointSlice)
    -> Result<()>;
    async fn delete_endpoint_slice(&self, slice: &EndpointSlice) -> Result<()>;
}
