//! Proxy request handlers.

mod http;
mod mitm;
mod tunnel;

pub use self::http::{upstream_client, HttpHandler, UpstreamClient};
pub use self::mitm::MitmHandler;
pub use self::tunnel::TunnelHandler;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{header, Request, Response, StatusCode};

use crate::context::ProxyContext;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;
pub type ProxyRequest = Request<ProxyBody>;
pub type ProxyResponse = Response<ProxyBody>;

/// A proxy conversation endpoint.
///
/// Handlers are plug-compatible: the router dispatches to them, and the
/// MITM handler re-injects intercepted sub-requests into one. A handler
/// never fails; anything that goes wrong maps to an error response or, if
/// response bytes were already on the wire, to tearing the connection
/// down.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: ProxyRequest, ctx: ProxyContext) -> ProxyResponse;
}

/// Handler answering every request with a fixed status.
pub struct StatusHandler(pub StatusCode);

#[async_trait]
impl Handler for StatusHandler {
    async fn handle(&self, _req: ProxyRequest, ctx: ProxyContext) -> ProxyResponse {
        ctx.set_status(self.0.as_u16());
        status_response(self.0)
    }
}

pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text error response carrying the canonical reason phrase.
pub fn status_response(status: StatusCode) -> ProxyResponse {
    let body = format!("{}\n", status.canonical_reason().unwrap_or_default());
    let mut rsp = Response::new(full(body));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    rsp.headers_mut().insert(
        header::HeaderName::from_static("x-content-type-options"),
        header::HeaderValue::from_static("nosniff"),
    );
    rsp
}
