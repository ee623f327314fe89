//! Dispatch of proxy requests to handlers by method and target host.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};

use crate::context::ProxyContext;
use crate::handler::{Handler, ProxyRequest, ProxyResponse, StatusHandler};

/// Host pattern for CONNECT routing.
///
/// - `example.com` matches exactly the host name
/// - `127.0.0.1` matches exactly the IP literal
/// - `.example.com` matches `example.com` and all of its subdomains
#[derive(Clone, Debug)]
pub struct HostPattern {
    template: String,
    kind: PatternKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PatternKind {
    Exact,
    Suffix,
    Ip,
}

impl HostPattern {
    pub fn new<T: Into<String>>(template: T) -> Self {
        let template = template.into();
        let kind = if template.starts_with('.') {
            PatternKind::Suffix
        } else if template.parse::<IpAddr>().is_ok() {
            PatternKind::Ip
        } else {
            PatternKind::Exact
        };
        Self { template, kind }
    }

    pub fn matches(&self, host: &str) -> bool {
        match self.kind {
            PatternKind::Exact | PatternKind::Ip => host == self.template,
            PatternKind::Suffix => {
                // `.example.com` also covers the bare `example.com`
                if host.len() == self.template.len() - 1 {
                    self.template.ends_with(host)
                } else {
                    host.ends_with(&self.template)
                }
            }
        }
    }
}

struct Route {
    pattern: HostPattern,
    handler: Arc<dyn Handler>,
}

/// Routes proxy requests to handlers according to method and host rules.
///
/// A freshly constructed `Router` is a usable proxy server in the sense
/// that it returns valid HTTP responses for everything; it will not
/// forward anything anywhere until handlers are plugged in.
pub struct Router {
    default_http: Arc<dyn Handler>,
    default_connect: Arc<dyn Handler>,
    not_found: Arc<dyn Handler>,
    routes: Vec<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            default_http: Arc::new(StatusHandler(StatusCode::NOT_FOUND)),
            default_connect: Arc::new(StatusHandler(StatusCode::METHOD_NOT_ALLOWED)),
            not_found: Arc::new(StatusHandler(StatusCode::NOT_FOUND)),
            routes: Vec::new(),
        }
    }

    /// Handler for non-CONNECT proxy requests.
    pub fn default_http(mut self, handler: Arc<dyn Handler>) -> Self {
        self.default_http = handler;
        self
    }

    /// Fallback CONNECT handler, used when no host pattern matches.
    pub fn default_connect(mut self, handler: Arc<dyn Handler>) -> Self {
        self.default_connect = handler;
        self
    }

    /// Handler for requests which are not proxy requests at all.
    pub fn not_found(mut self, handler: Arc<dyn Handler>) -> Self {
        self.not_found = handler;
        self
    }

    /// Register a CONNECT handler for hosts matching `pattern`.
    ///
    /// Patterns are tried exactly in registration order and the first
    /// match wins, so registering `.example.com` before `example.com`
    /// sends `example.com` to the former.
    pub fn handle_connect(&mut self, pattern: HostPattern, handler: Arc<dyn Handler>) {
        self.routes.push(Route { pattern, handler });
    }
}

/// Strip the square brackets an IPv6 authority carries around its host.
pub(crate) fn hostname(uri: &http::Uri) -> &str {
    uri.host()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, req: ProxyRequest, ctx: ProxyContext) -> ProxyResponse {
        if req.method() == Method::CONNECT {
            let host = hostname(req.uri());
            for route in &self.routes {
                if route.pattern.matches(host) {
                    return route.handler.handle(req, ctx).await;
                }
            }
            return self.default_connect.handle(req, ctx).await;
        }
        if req.uri().authority().is_some() {
            return self.default_http.handle(req, ctx).await;
        }
        self.not_found.handle(req, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFactory;
    use crate::handler::empty;
    use http::Request;

    #[test]
    fn exact_pattern() {
        let p = HostPattern::new("example.com");
        assert!(p.matches("example.com"));
        assert!(!p.matches("www.example.com"));
        assert!(!p.matches("example.net"));
    }

    #[test]
    fn suffix_pattern() {
        let p = HostPattern::new(".example.com");
        assert!(p.matches("example.com"));
        assert!(p.matches("www.example.com"));
        assert!(p.matches("deep.www.example.com"));
        assert!(!p.matches("example.net"));
        assert!(!p.matches("badexample.com"));
    }

    #[test]
    fn ip_pattern() {
        let p = HostPattern::new("127.0.0.1");
        assert!(p.matches("127.0.0.1"));
        assert!(!p.matches("127.0.0.2"));
        assert!(!p.matches("localhost"));
        assert!(!p.matches("example.com"));
    }

    struct Marker(&'static str);

    #[async_trait]
    impl Handler for Marker {
        async fn handle(&self, _req: ProxyRequest, _ctx: ProxyContext) -> ProxyResponse {
            let mut rsp = http::Response::new(empty());
            rsp.headers_mut()
                .insert("x-marker", http::HeaderValue::from_static(self.0));
            rsp
        }
    }

    fn ctx() -> ProxyContext {
        ContextFactory::new(false).context(
            "127.0.0.1:4000".parse().unwrap(),
            Method::GET,
            "test".into(),
        )
    }

    fn connect(target: &str) -> ProxyRequest {
        Request::builder()
            .method(Method::CONNECT)
            .uri(target)
            .body(empty())
            .unwrap()
    }

    fn marker(rsp: &ProxyResponse) -> Option<&str> {
        rsp.headers().get("x-marker").and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn first_match_wins() {
        let mut router = Router::new();
        router.handle_connect(HostPattern::new(".example.com"), Arc::new(Marker("a")));
        router.handle_connect(HostPattern::new("example.com"), Arc::new(Marker("b")));

        let rsp = router.handle(connect("example.com:443"), ctx()).await;
        assert_eq!(marker(&rsp), Some("a"));

        let rsp = router.handle(connect("www.example.com:443"), ctx()).await;
        assert_eq!(marker(&rsp), Some("a"));
    }

    #[tokio::test]
    async fn unmatched_connect_falls_back() {
        let mut router = Router::new().default_connect(Arc::new(Marker("fallback")));
        router.handle_connect(HostPattern::new("example.com"), Arc::new(Marker("a")));

        let rsp = router.handle(connect("example.net:443"), ctx()).await;
        assert_eq!(marker(&rsp), Some("fallback"));
    }

    #[tokio::test]
    async fn connect_without_route_is_405() {
        let router = Router::new();
        let rsp = router.handle(connect("example.com:443"), ctx()).await;
        assert_eq!(rsp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn absolute_uri_goes_to_default_http() {
        let router = Router::new().default_http(Arc::new(Marker("http")));
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://example.com/path")
            .body(empty())
            .unwrap();
        let rsp = router.handle(req, ctx()).await;
        assert_eq!(marker(&rsp), Some("http"));
    }

    #[tokio::test]
    async fn origin_form_is_not_found() {
        let router = Router::new().default_http(Arc::new(Marker("http")));
        let req = Request::builder()
            .method(Method::GET)
            .uri("/path")
            .body(empty())
            .unwrap();
        let rsp = router.handle(req, ctx()).await;
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    }
}
