//! Tower middleware applying admission control to gRPC channels.
//!
//! A gRPC call over HTTP/2 is a stream in both directions, unary calls
//! included. The slot is taken before the request is handed to the channel
//! and kept until the response body finishes: end of stream, trailers, an
//! error, or the body being dropped. A request that cannot be sent releases
//! the slot on the send path instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tower::{Layer, Service};

use super::{AdmissionController, StreamSlot};

pub type BoxError = tower::BoxError;

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send + 'static>>;

/// Wraps services in [`Admitted`].
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    controller: Arc<AdmissionController>,
}

impl AdmissionLayer {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = Admitted<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Admitted {
            inner,
            controller: Arc::clone(&self.controller),
        }
    }
}

/// A service whose calls each hold an admission slot.
#[derive(Debug, Clone)]
pub struct Admitted<S> {
    inner: S,
    controller: Arc<AdmissionController>,
}

impl<S> Admitted<S> {
    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for Admitted<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ReqBody: Send + 'static,
{
    type Response = http::Response<AdmittedBody<ResBody>>;
    type Error = BoxError;
    type Future = BoxFuture<Self::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        // The instance polled ready goes into the future; keep a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let controller = Arc::clone(&self.controller);

        Box::pin(async move {
            let slot = controller.stream_slot().await?;
            match inner.call(request).await {
                Ok(response) => Ok(response.map(|body| AdmittedBody::new(body, slot))),
                Err(err) => {
                    slot.release();
                    Err(err.into())
                }
            }
        })
    }
}

pin_project! {
    /// Response body that returns its admission slot when the stream ends.
    #[derive(Debug)]
    pub struct AdmittedBody<B> {
        #[pin]
        inner: B,
        slot: StreamSlot,
    }
}

impl<B> AdmittedBody<B> {
    fn new(inner: B, slot: StreamSlot) -> Self {
        Self { inner, slot }
    }

    pub fn slot(&self) -> &StreamSlot {
        &self.slot
    }
}

impl<B: Body> Body for AdmittedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        match &frame {
            Some(Ok(frame)) if !frame.is_trailers() => {}
            _ => {
                this.slot.release();
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
