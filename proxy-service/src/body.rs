//! Response/request body plumbing for the data plane.
//!
//! Bodies are streamed, never buffered: an upstream response is relayed to
//! the client frame by frame, with an optional idle timeout that aborts the
//! stream when neither side makes progress.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use tokio::time::{Instant, Sleep};

use crate::error::ServerError;

/// Boxed body used on both sides of the proxy. Unsync because hyper's
/// `Incoming` request body is threaded straight through to the upstream.
pub type ProxyBody = UnsyncBoxBody<Bytes, ServerError>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Aborts a streaming body once no frame has arrived for `idle` long.
///
/// Terminating mid-stream makes hyper drop the client connection, which is
/// the contract for an upstream that stalls after headers were sent.
pub struct IdleTimeoutBody {
    inner: ProxyBody,
    idle: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimeoutBody {
    pub fn new(inner: ProxyBody, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            sleep: Box::pin(tokio::time::sleep(idle)),
        }
    }
}

impl Body for IdleTimeoutBody {
    type Data = Bytes;
    type Error = ServerError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ServerError>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                let idle = this.idle;
                this.sleep.as_mut().reset(Instant::now() + idle);
                Poll::Ready(frame)
            }
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Some(Err(ServerError::UpstreamAborted(
                    "idle timeout while streaming".to_string(),
                )))),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
