use std::sync::Arc;

use async_trait::async_trait;
use cni_node_k8s_utils::KubeStore;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::cni::{Command, PodRequest};
use crate::{Error, Result};

/// Performs the pod network setup for a validated request.
///
/// The returned bytes are written back to the runtime verbatim, so ADD is
/// expected to return a serialized CNI result while the other commands
/// usually return nothing.
#[async_trait]
pub trait CniHandler: Send + Sync + 'static {
    /// Read-only lookup state handed to every call, owned by the caller of
    /// [`crate::cni::Server::start`].
    type Context: Send + Sync + 'static;

    async fn handle(&self, request: &PodRequest, ctx: &Self::Context) -> Result<Vec<u8>>;
}

/// Lookup state for [`ChainedHandler`].
pub struct PodContext {
    pub pods: Arc<dyn KubeStore<Pod> + Send + Sync>,
    pub node_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetConf {
    #[serde(default)]
    cni_version: Option<String>,

    #[serde(default, rename = "prevResult")]
    previous_result: Option<Value>,
}

/// Handler for running chained after the primary plugin. The interfaces
/// already exist once ADD reaches this node agent, so the previous result is
/// handed back unchanged.
#[derive(Clone, Default)]
pub struct ChainedHandler;

#[async_trait]
impl CniHandler for ChainedHandler {
    type Context = PodContext;

    async fn handle(&self, request: &PodRequest, ctx: &PodContext) -> Result<Vec<u8>> {
        match request.command {
            Command::Add => add(request, ctx),
            Command::Delete | Command::Update | Command::Check => {
                debug!(
                    "{} for {}/{} requires no changes",
                    request.command, request.pod_namespace, request.pod_name
                );
                Ok(vec![])
            }
        }
    }
}

fn add(request: &PodRequest, ctx: &PodContext) -> Result<Vec<u8>> {
    let obj_ref = ObjectRef::new(&request.pod_name).within(&request.pod_namespace);
    let Some(pod) = ctx.pods.get_resource(&obj_ref) else {
        return Err(Error::Handler(format!(
            "pod {}/{} not found on node {}",
            request.pod_namespace, request.pod_name, ctx.node_name
        )));
    };
    if let Some(uid) = &request.pod_uid
        && pod.metadata.uid.as_ref() != Some(uid)
    {
        return Err(Error::Handler(format!(
            "pod {}/{} uid mismatch, expected {}",
            request.pod_namespace, request.pod_name, uid
        )));
    }

    let conf: NetConf = serde_json::from_slice(&request.raw_config)?;
    let Some(prev) = conf.previous_result else {
        return Err(Error::Handler(
            "no previous result found, this CNI must be chained".into(),
        ));
    };
    info!(
        "add for {}/{} container {} with cni version {}",
        request.pod_namespace,
        request.pod_name,
        request.container_id,
        conf.cni_version.as_deref().unwrap_or("unknown")
    );

    Ok(serde_json::to_vec(&prev)?)
}
