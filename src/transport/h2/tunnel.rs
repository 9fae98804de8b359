//! CONNECT stream exposed as a byte stream.
//!
//! Writes draw on a per-stream credit of [`TUNNEL_SEND_BUFFER`] bytes which
//! the driver hands back only once the bytes went out as DATA, so a writer
//! outrunning the peer's flow-control window waits instead of queueing.
//! Received bytes are acknowledged to the driver as the caller reads them,
//! and the stream WINDOW_UPDATE follows from that.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, AcquireError, OwnedSemaphorePermit, Semaphore};

use super::driver::Command;

/// Bytes a tunnel may have queued in the driver but not yet sent.
pub(crate) const TUNNEL_SEND_BUFFER: usize = 64 * 1024;

type Acquire = Pin<Box<dyn Future<Output = Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

/// One HTTP/2 CONNECT stream. Dropping it resets the stream.
pub struct H2Tunnel {
    stream_id: u32,
    commands: mpsc::UnboundedSender<Command>,
    inbound: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    buffered: Bytes,
    credit: Arc<Semaphore>,
    acquiring: Option<Acquire>,
    write_closed: bool,
}

impl H2Tunnel {
    pub(crate) fn new(
        stream_id: u32,
        commands: mpsc::UnboundedSender<Command>,
        inbound: mpsc::UnboundedReceiver<io::Result<Bytes>>,
        credit: Arc<Semaphore>,
    ) -> Self {
        Self {
            stream_id,
            commands,
            inbound,
            buffered: Bytes::new(),
            credit,
            acquiring: None,
            write_closed: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Wait for send credit covering up to `want` bytes; returns how many
    /// bytes were granted.
    fn poll_credit(&mut self, cx: &mut Context<'_>, want: usize) -> Poll<io::Result<usize>> {
        let want = want.min(TUNNEL_SEND_BUFFER);
        let permit = match self.acquiring.as_mut() {
            Some(acquire) => match acquire.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    self.acquiring = None;
                    result
                }
            },
            None => match self.credit.clone().try_acquire_many_owned(want as u32) {
                Ok(permit) => Ok(permit),
                Err(tokio::sync::TryAcquireError::Closed) => {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
                }
                Err(tokio::sync::TryAcquireError::NoPermits) => {
                    let mut acquire: Acquire =
                        Box::pin(self.credit.clone().acquire_many_owned(want as u32));
                    match acquire.as_mut().poll(cx) {
                        Poll::Pending => {
                            self.acquiring = Some(acquire);
                            return Poll::Pending;
                        }
                        Poll::Ready(result) => result,
                    }
                }
            },
        };
        let permit = permit.map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let granted = permit.num_permits();
        // the driver returns the credit as DATA leaves
        permit.forget();
        Poll::Ready(Ok(granted))
    }
}

impl AsyncRead for H2Tunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buffered.is_empty() {
            match self.inbound.poll_recv(cx) {
                Poll::Ready(Some(Ok(data))) => self.buffered = data,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.buffered.len().min(buf.remaining());
        let chunk = self.buffered.split_to(n);
        buf.put_slice(&chunk);
        let _ = self.commands.send(Command::Consumed {
            stream_id: self.stream_id,
            len: n as u32,
        });
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for H2Tunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let granted = match self.poll_credit(cx, buf.len()) {
            Poll::Ready(Ok(granted)) => granted,
            Poll::Ready(Err(e)) => {
                self.write_closed = true;
                return Poll::Ready(Err(e));
            }
            Poll::Pending => return Poll::Pending,
        };
        // a retried write may carry a shorter buffer than the credit taken
        let n = granted.min(buf.len());
        if granted > n {
            self.credit.add_permits(granted - n);
        }
        let command = Command::Data {
            stream_id: self.stream_id,
            data: Bytes::copy_from_slice(&buf[..n]),
            end_stream: false,
        };
        if self.commands.send(command).is_err() {
            self.write_closed = true;
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.write_closed {
            self.write_closed = true;
            self.acquiring = None;
            let _ = self.commands.send(Command::Data {
                stream_id: self.stream_id,
                data: Bytes::new(),
                end_stream: true,
            });
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for H2Tunnel {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Reset {
            stream_id: self.stream_id,
        });
    }
}
