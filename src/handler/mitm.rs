//! CONNECT interception: TLS termination with a locally issued leaf and
//! re-injection of the inner requests into a plain HTTP handler.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsAcceptor;

use super::{empty, status_response, Handler, ProxyRequest, ProxyResponse};
use crate::context::ProxyContext;
use crate::issuer::CertCache;
use crate::meter::MeteredStream;
use crate::router::hostname;

/// Serves CONNECT requests by terminating TLS with a certificate minted
/// for the target and proxying each request read off the session.
pub struct MitmHandler {
    inner: Arc<dyn Handler>,
    certs: CertCache,
}

impl MitmHandler {
    pub fn new(inner: Arc<dyn Handler>, certs: CertCache) -> Self {
        Self { inner, certs }
    }
}

#[async_trait]
impl Handler for MitmHandler {
    async fn handle(&self, req: ProxyRequest, ctx: ProxyContext) -> ProxyResponse {
        ctx.set_name("mitm");

        if req.method() != Method::CONNECT {
            ctx.set_status(StatusCode::METHOD_NOT_ALLOWED.as_u16());
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }
        let Some(authority) = req.uri().authority().cloned() else {
            ctx.set_status(StatusCode::BAD_REQUEST.as_u16());
            return status_response(StatusCode::BAD_REQUEST);
        };
        let host = hostname(req.uri()).to_string();

        ctx.set_status(StatusCode::OK.as_u16());
        let inner = self.inner.clone();
        let certs = self.certs.clone();
        let intercept_ctx = ctx.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    intercept(upgraded, authority, host, inner, certs, intercept_ctx).await;
                }
                Err(err) => {
                    intercept_ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
                    tracing::debug!(error = %err, "connection upgrade failed");
                }
            }
        });

        Response::new(empty())
    }
}

async fn intercept(
    upgraded: hyper::upgrade::Upgraded,
    authority: Authority,
    host: String,
    inner: Arc<dyn Handler>,
    certs: CertCache,
    ctx: ProxyContext,
) {
    let leaf = match certs.leaf_for(&host).await {
        Ok(leaf) => leaf,
        Err(err) => {
            tracing::warn!(error = %err, %host, "certificate issuance failed");
            return;
        }
    };

    // Counts TLS record bytes on the raw stream, underneath the session.
    let written = Arc::new(AtomicU64::new(0));
    let metered = MeteredStream::new(TokioIo::new(upgraded), written.clone());

    let tls = match TlsAcceptor::from(leaf.server_config.clone())
        .accept(metered)
        .await
    {
        Ok(tls) => tls,
        Err(err) => {
            tracing::warn!(error = %err, %host, "TLS handshake failed");
            ctx.set_content_length(written.load(Ordering::Relaxed));
            return;
        }
    };

    let service = service_fn({
        let ctx = ctx.clone();
        move |mut req: Request<Incoming>| {
            let inner = inner.clone();
            let ctx = ctx.clone();
            let authority = authority.clone();
            async move {
                rewrite_uri(&mut req, &authority);
                let child = ctx.child(req.method().clone(), req.uri().to_string());
                let rsp = inner.handle(req.map(|body| body.boxed()), child).await;
                Ok::<_, Infallible>(rsp)
            }
        }
    });

    // The session carries plain HTTP/1.1; requests are served strictly in
    // order off the connection.
    let conn = hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls), service)
        .with_upgrades();
    if let Err(err) = conn.await {
        tracing::debug!(error = %err, %host, "intercepted session ended");
    }
    ctx.set_content_length(written.load(Ordering::Relaxed));
}

/// Rebuild the origin-form target read off the TLS session into the
/// absolute HTTPS URI of the intercepted request. The Host header names
/// the target; the CONNECT authority is the fallback.
fn rewrite_uri<B>(req: &mut Request<B>, connect_authority: &Authority) {
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Authority>().ok());

    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(Scheme::HTTPS);
    if parts.authority.is_none() {
        parts.authority = host.or_else(|| Some(connect_authority.clone()));
    }
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_origin_form_to_absolute_https() {
        let mut req = Request::builder()
            .method(Method::GET)
            .uri("/path?q=1")
            .header("host", "www.example.com")
            .body(())
            .unwrap();
        rewrite_uri(&mut req, &"www.example.com:443".parse().unwrap());
        assert_eq!(req.uri(), "https://www.example.com/path?q=1");
    }

    #[test]
    fn falls_back_to_connect_authority() {
        let mut req = Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(())
            .unwrap();
        rewrite_uri(&mut req, &"example.com:443".parse().unwrap());
        assert_eq!(req.uri(), "https://example.com:443/");
    }
}
