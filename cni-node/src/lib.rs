pub mod agent;
pub mod cni;
pub mod config;
pub mod healthcheck;
pub mod http;
pub mod kubernetes;
pub mod metrics;

use std::fmt;
use std::time::Duration;

use cni_node_k8s_utils::NamespacedName;
use thiserror::Error;

use crate::cni::RequestError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("k8s utils error: {0}")]
    K8sUtils(#[from] cni_node_k8s_utils::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("{0}")]
    Handler(String),

    #[error("handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    #[error("could not fetch endpoint slices for service {service}: {source}")]
    CacheFetch {
        service: NamespacedName,
        #[source]
        source: cni_node_k8s_utils::Error,
    },

    #[error("skipping endpoint slice {slice}: {source}")]
    SliceOwner {
        slice: NamespacedName,
        #[source]
        source: cni_node_k8s_utils::Error,
    },

    #[error("failed to sync health checks: {0}")]
    HealthSync(String),

    #[error("failed to bind health check port {port} for service {service}: {source}")]
    HealthBind {
        service: NamespacedName,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("socket {0} is already in use")]
    SocketInUse(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::IoError(_) => "io",
            Error::KubeError(_) => "kube",
            Error::K8sUtils(_) => "k8s_utils",
            Error::JsonConversion(_) => "json",
            Error::Request(_) => "request",
            Error::Handler(_) => "handler",
            Error::HandlerTimeout(_) => "handler_timeout",
            Error::CacheFetch { .. } => "cache_fetch",
            Error::SliceOwner { .. } => "slice_owner",
            Error::HealthSync(_) => "health_sync",
            Error::HealthBind { .. } => "health_bind",
            Error::SocketInUse(_) => "socket_in_use",
            Error::Aggregate(_) => "aggregate",
            Error::Task(_) => "task",
            Error::Other(_) => "other",
        };
        label.into()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Several independent failures of one multi-step operation. None of the
/// underlying errors are dropped; they are only joined when displayed.
#[derive(Debug)]
pub struct AggregateError(Vec<Error>);

impl AggregateError {
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, e) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for AggregateError {}

/// Collapses a list of errors: nothing to report is `Ok`, a single error is
/// returned as is, anything more becomes an [`AggregateError`].
pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(AggregateError(errors).into()),
    }
}
