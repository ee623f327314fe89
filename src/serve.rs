use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http::{Method, Request};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::context::ContextFactory;
use crate::error::Error;
use crate::handler::{upstream_client, Handler, HttpHandler, MitmHandler, TunnelHandler};
use crate::issuer::{CertCache, SelfSignedIssuer};
use crate::router::{HostPattern, Router};

#[derive(Parser, Clone)]
#[clap(author, version, about)]
pub struct BootArgs {
    /// Log level e.g. trace, debug, info, warn, error
    #[clap(long, env = "MPROXY_LOG", default_value = "info")]
    pub log: tracing::Level,

    /// Bind address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Upstream connect timeout in seconds
    #[clap(short = 'T', long, default_value = "5")]
    pub connect_timeout: u64,

    /// Do not add/update the Via header on forwarded requests
    #[clap(long)]
    pub novia: bool,

    /// Do not add/update the X-Forwarded-For header on forwarded requests
    #[clap(long)]
    pub noxforwardedfor: bool,

    /// Disable access logging
    #[clap(long)]
    pub noaccesslog: bool,

    /// Comma-separated host patterns whose CONNECT requests are
    /// intercepted; `*` makes interception the CONNECT fallback
    #[clap(long)]
    pub mitm: Option<String>,

    /// Comma-separated host patterns whose CONNECT requests are tunneled;
    /// `*` makes tunneling the CONNECT fallback
    #[clap(long)]
    pub tunnel: Option<String>,

    /// Certificate cache capacity, 0 for unbounded
    #[clap(long, default_value = "0")]
    pub cert_cache_size: u64,
}

pub fn run(args: BootArgs) -> crate::Result<()> {
    // Connection pool chatter from the upstream client drowns out debug
    // logs, keep it at warn unless overridden from the environment.
    let filter = EnvFilter::from_default_env()
        .add_directive(args.log.into())
        .add_directive("hyper_util=warn".parse()?);
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(args.log)
            .with_env_filter(filter)
            .finish(),
    )?;

    tracing::info!("OS: {}", std::env::consts::OS);
    tracing::info!("Arch: {}", std::env::consts::ARCH);
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Connect timeout: {}s", args.connect_timeout);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve(args))
}

async fn serve(args: BootArgs) -> crate::Result<()> {
    let router = Arc::new(build_router(&args)?);
    let factory = ContextFactory::new(!args.noaccesslog);

    let socket = if args.listen.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(args.listen)?;
    let listener = socket.listen(1024)?;

    tracing::info!("proxy server listening on {}", args.listen);
    serve_router(listener, router, factory).await
}

/// Build the request router described by the boot arguments.
///
/// Each pattern list registers its handler for the named hosts in order;
/// the `*` entry claims the CONNECT fallback slot and may appear at most
/// once across both lists. With neither list given, every CONNECT is
/// tunneled.
pub fn build_router(args: &BootArgs) -> crate::Result<Router> {
    let client = upstream_client(Duration::from_secs(args.connect_timeout))?;
    let http = Arc::new(
        HttpHandler::new(client)
            .via(!args.novia)
            .x_forwarded_for(!args.noxforwardedfor),
    );

    let issuer = Arc::new(SelfSignedIssuer::new());
    let mitm: Arc<dyn Handler> = Arc::new(MitmHandler::new(
        http.clone(),
        CertCache::new(issuer, args.cert_cache_size),
    ));
    let tunnel: Arc<dyn Handler> = Arc::new(
        TunnelHandler::new().dial_timeout(Duration::from_secs(args.connect_timeout)),
    );

    let (mitm_patterns, tunnel_patterns) = match (args.mitm.as_deref(), args.tunnel.as_deref()) {
        (None, None) => (None, Some("*")),
        (mitm, tunnel) => (mitm, tunnel),
    };

    let mut router = Router::new().default_http(http);
    let mut fallback_taken = false;
    router = register(router, mitm, mitm_patterns, &mut fallback_taken)?;
    router = register(router, tunnel, tunnel_patterns, &mut fallback_taken)?;
    Ok(router)
}

fn register(
    mut router: Router,
    handler: Arc<dyn Handler>,
    patterns: Option<&str>,
    fallback_taken: &mut bool,
) -> crate::Result<Router> {
    let Some(patterns) = patterns else {
        return Ok(router);
    };
    for pattern in patterns.split(',') {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        if pattern != "*" {
            router.handle_connect(HostPattern::new(pattern), handler.clone());
            continue;
        }
        if *fallback_taken {
            return Err(Error::ConfigError(
                "multiple fallback handlers specified".into(),
            ));
        }
        *fallback_taken = true;
        router = router.default_connect(handler.clone());
    }
    Ok(router)
}

/// Accept loop. Each connection is served on its own task.
pub async fn serve_router(
    listener: TcpListener,
    router: Arc<Router>,
    factory: Arc<ContextFactory>,
) -> crate::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let router = router.clone();
        let factory = factory.clone();
        tokio::spawn(serve_connection(stream, peer, router, factory));
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    factory: Arc<ContextFactory>,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        let factory = factory.clone();
        async move {
            let target = if req.method() == Method::CONNECT {
                req.uri()
                    .authority()
                    .map(|authority| authority.to_string())
                    .unwrap_or_default()
            } else {
                req.uri().to_string()
            };
            let ctx = factory.context(peer, req.method().clone(), target);
            let rsp = router.handle(req.map(|body| body.boxed()), ctx).await;
            Ok::<_, Infallible>(rsp)
        }
    });

    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .auto_date_header(false)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        tracing::debug!(error = %err, "failed to serve connection");
    }
}
