mod status;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Serves `/metrics` and `/readyz` until `cancel` fires. The node reports
/// ready once `ready` has been cancelled.
pub async fn serve_metrics(
    addr: SocketAddr,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let state = Arc::new(status::State::new(ready));

    status::serve(addr, state, cancel).await
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}
