//! Plain HTTP proxying of absolute-URI requests.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, VIA};
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

use super::{status_response, Handler, ProxyRequest, ProxyResponse};
use crate::context::ProxyContext;
use crate::meter::MeteredBody;

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, super::ProxyBody>;

/// Hop-by-hop headers never forwarded to the target server.
/// `Proxy-Connection` is non-standard but still sent by libcurl.
const HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// A plain HTTP proxy capable of serving any method except CONNECT.
pub struct HttpHandler {
    client: UpstreamClient,
    append_via: bool,
    append_xff: bool,
    via_ident: String,
}

impl HttpHandler {
    pub fn new(client: UpstreamClient) -> Self {
        Self {
            client,
            append_via: true,
            append_xff: true,
            via_ident: default_ident(),
        }
    }

    /// Whether to append this proxy to the `Via` header of forwarded
    /// requests.
    pub fn via(mut self, enabled: bool) -> Self {
        self.append_via = enabled;
        self
    }

    /// Identity used in the appended `Via` entry.
    pub fn via_ident<T: Into<String>>(mut self, ident: T) -> Self {
        self.via_ident = ident.into();
        self
    }

    /// Whether to append the client address to `X-Forwarded-For`.
    pub fn x_forwarded_for(mut self, enabled: bool) -> Self {
        self.append_xff = enabled;
        self
    }
}

#[async_trait]
impl Handler for HttpHandler {
    async fn handle(&self, req: ProxyRequest, ctx: ProxyContext) -> ProxyResponse {
        ctx.set_name("http");

        if req.method() == Method::CONNECT {
            ctx.set_status(StatusCode::METHOD_NOT_ALLOWED.as_u16());
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }
        if req.uri().authority().is_none() {
            ctx.set_status(StatusCode::BAD_REQUEST.as_u16());
            return status_response(StatusCode::BAD_REQUEST);
        }

        let (mut parts, body) = req.into_parts();

        // Tokens must be collected before the Connection header itself is
        // stripped with the rest of the hop-by-hop set.
        let tokens = connection_tokens(&parts.headers);
        remove_hop_headers(&mut parts.headers);
        for token in tokens {
            parts.headers.remove(token.as_str());
        }

        if self.append_xff {
            append_header(
                &mut parts.headers,
                HeaderName::from_static("x-forwarded-for"),
                &ctx.client().ip().to_string(),
            );
        }
        if self.append_via {
            append_header(&mut parts.headers, VIA, &format!("1.1 {}", self.via_ident));
        }

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(rsp) => {
                ctx.set_status(rsp.status().as_u16());
                rsp.map(|body| MeteredBody::new(body, ctx.clone()).boxed())
            }
            Err(err) => {
                let status = if is_timeout(&err) {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                tracing::debug!(error = %err, "upstream round trip failed");
                ctx.set_status(status.as_u16());
                status_response(status)
            }
        }
    }
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// Header names listed in the incoming `Connection` header.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Append `value` to a comma-separated list header, creating it if absent.
fn append_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let combined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(orig) if !orig.is_empty() => format!("{orig}, {value}"),
        _ => value.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(name, value);
    }
}

fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == ErrorKind::TimedOut {
                return true;
            }
        }
        if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
        cur = e.source();
    }
    false
}

fn default_ident() -> String {
    hostname::get()
        .map(|host| host.to_string_lossy().into_owned())
        .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string())
}

/// Shared round-tripper for requests re-issued to target servers.
///
/// Certificates presented by targets are accepted without verification,
/// matching the interception model where the client already trusts this
/// proxy instead of the origin.
pub fn upstream_client(connect_timeout: Duration) -> crate::Result<UpstreamClient> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
        .with_no_client_auth();

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Ok(Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .build(https))
}

#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("host", HeaderValue::from_static("example.com"));

        remove_hop_headers(&mut headers);

        for name in HOP_HEADERS {
            assert!(!headers.contains_key(name), "{name} survived");
        }
        assert!(headers.contains_key("host"));
    }

    #[test]
    fn strips_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONNECTION,
            HeaderValue::from_static("X-Strip-Me, Also-This"),
        );
        headers.insert("x-strip-me", HeaderValue::from_static("1"));
        headers.insert("also-this", HeaderValue::from_static("2"));
        headers.insert("x-keep-me", HeaderValue::from_static("3"));

        let tokens = connection_tokens(&headers);
        remove_hop_headers(&mut headers);
        for token in tokens {
            headers.remove(token.as_str());
        }

        assert!(!headers.contains_key("x-strip-me"));
        assert!(!headers.contains_key("also-this"));
        assert!(headers.contains_key("x-keep-me"));
    }

    #[test]
    fn appends_to_existing_list() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.0.2.1"),
        );
        append_header(
            &mut headers,
            HeaderName::from_static("x-forwarded-for"),
            "127.0.0.1",
        );
        assert_eq!(headers["x-forwarded-for"], "192.0.2.1, 127.0.0.1");
    }

    #[test]
    fn creates_missing_list_header() {
        let mut headers = HeaderMap::new();
        append_header(&mut headers, VIA, "1.1 gw.local");
        assert_eq!(headers["via"], "1.1 gw.local");

        append_header(&mut headers, VIA, "1.1 other");
        assert_eq!(headers["via"], "1.1 gw.local, 1.1 other");
    }
}
