//! HTTP/3 connection handle - non-blocking interface for sending requests.
//!
//! The handle sends commands to a driver task and receives responses via
//! channels. Clones share the same driver, so requests multiplex.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Uri};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Invalidation, Result};
use crate::fingerprint::PseudoHeaderOrder;
use crate::response::TransportResponse;
use crate::transport::h2::request_headers;

use super::driver::{Command, SessionState};

#[derive(Clone)]
pub struct H3Handle {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<SessionState>,
    pseudo_order: PseudoHeaderOrder,
}

impl std::fmt::Debug for H3Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H3Handle")
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl H3Handle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        state: Arc<SessionState>,
        pseudo_order: PseudoHeaderOrder,
    ) -> Self {
        Self {
            commands,
            state,
            pseudo_order,
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.state.accepting.load(Ordering::Acquire) && !self.commands.is_closed()
    }

    /// Send a request and wait for the complete response.
    ///
    /// Pseudo-headers follow the fingerprint order; connection-specific
    /// headers are dropped as in HTTP/2.
    pub async fn send_request(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<TransportResponse> {
        let headers = request_headers(method, uri, headers, &self.pseudo_order)?
            .into_iter()
            .map(|(name, value)| quiche::h3::Header::new(&name, &value))
            .collect();
        let (respond, response) = oneshot::channel();
        if !self.is_accepting() {
            return Err(Error::SessionInvalidated(Invalidation::ConnUnusable));
        }
        self.commands
            .send(Command::Request {
                headers,
                body,
                respond,
            })
            .map_err(|_| Error::SessionInvalidated(Invalidation::ConnUnusable))?;
        response
            .await
            .map_err(|_| Error::SessionInvalidated(Invalidation::ConnClosed))?
    }

    /// Send CONNECTION_CLOSE and stop the driver. In-flight requests fail.
    pub fn close(&self) {
        self.state.accepting.store(false, Ordering::Release);
        let _ = self.commands.send(Command::Shutdown);
    }
}
