//! The single process-wide upstream connection handle.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::upstream::{
    Connector, TransportFailure, UpstreamChannel, UpstreamError, UpstreamResult, UpstreamTarget,
};

/// Holds at most one open [`UpstreamChannel`].
///
/// Opening always closes the previous handle first, so the process never
/// holds two links to the upstream.
pub struct TransportChannel {
    connector: Arc<dyn Connector>,
    target: UpstreamTarget,
    goodbye_timeout: Duration,
    slot: RwLock<Option<Arc<dyn UpstreamChannel>>>,
}

impl TransportChannel {
    /// Create an empty channel slot.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        target: UpstreamTarget,
        goodbye_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            target,
            goodbye_timeout,
            slot: RwLock::new(None),
        }
    }

    /// Endpoint this channel connects to.
    #[must_use]
    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Open a new link, closing any previous one.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the connector fails or does not finish
    /// within `timeout`.
    pub async fn open(&self, timeout: Duration) -> UpstreamResult<Arc<dyn UpstreamChannel>> {
        self.close().await;

        let handle =
            match tokio::time::timeout(timeout, self.connector.open(&self.target, timeout)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(UpstreamError::transport(
                        TransportFailure::Timeout,
                        format!("connecting to {} took longer than {timeout:?}", self.target),
                    ));
                },
            };

        let previous = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&handle));
        if let Some(previous) = previous {
            // A concurrent open raced us; keep only the newest link.
            previous.close().await;
        }

        info!(target = %self.target, "Upstream channel opened");
        Ok(handle)
    }

    /// The open handle, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn UpstreamChannel>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a handle is open and structurally alive. No I/O.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.current().is_some_and(|h| h.is_alive())
    }

    /// Close the handle without saying goodbye.
    pub async fn close(&self) {
        let taken = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = taken {
            handle.close().await;
            debug!(target = %self.target, "Upstream channel closed");
        }
    }

    /// Send the best-effort `DisconnectClient` goodbye, then close.
    pub async fn close_gracefully(&self) {
        let taken = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = taken else {
            return;
        };

        if handle.is_alive() {
            match tokio::time::timeout(self.goodbye_timeout, handle.disconnect_client()).await {
                Ok(Ok(())) => debug!("Upstream acknowledged disconnect"),
                Ok(Err(e)) => debug!(error = %e, "Disconnect notification failed"),
                Err(_) => debug!("Disconnect notification timed out"),
            }
        }

        handle.close().await;
        info!(target = %self.target, "Upstream channel closed");
    }
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("target", &self.target)
            .field("open", &self.current().is_some())
            .finish_non_exhaustive()
    }
}
