//! Serve loop with startup warm-up and graceful shutdown.

use std::future::Future;

use superbridge_gateway::Gateway;
use superbridge_telemetry::RequestContext;
use tokio::net::TcpListener;
use tracing::{Instrument, info, warn};

use crate::routes::router;

/// Connect and load models once, logging failures instead of returning them.
///
/// The server starts either way; a caller that arrives later triggers the
/// same steps on demand.
pub async fn warm_up(gateway: &Gateway) {
    let ctx = RequestContext::new("startup").with_operation("warm_up");
    async {
        if let Err(e) = gateway.connect().await {
            warn!(error = %e, "Upstream not reachable at startup; will retry on /reconnect");
            return;
        }
        match gateway.ensure_ready().await {
            Ok(()) => info!("Upstream models ready"),
            Err(e) => warn!(error = %e, "Models not ready at startup; first chat will retry"),
        }
    }
    .instrument(ctx.span())
    .await;
}

/// Serve HTTP on `listener` until `shutdown` resolves.
///
/// On shutdown the gateway is disconnected first, which ends every streaming
/// reply, so the graceful drain does not wait on long generations.
///
/// # Errors
///
/// Returns an error if the listener fails while serving.
pub async fn run<F>(listener: TcpListener, gateway: Gateway, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }

    let signal = {
        let gateway = gateway.clone();
        async move {
            shutdown.await;
            info!("Shutdown requested; aborting in-flight chats");
            gateway.disconnect().await;
        }
    };

    let served = axum::serve(listener, router(gateway.clone()))
        .with_graceful_shutdown(signal)
        .await;

    // A request that slipped in during the drain may have reopened the channel.
    gateway.disconnect().await;
    info!("HTTP server stopped");
    served
}
