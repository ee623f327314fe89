//! Opaque CONNECT tunneling.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use http::{Method, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{empty, status_response, Handler, ProxyRequest, ProxyResponse};
use crate::context::ProxyContext;

/// Serves CONNECT requests by relaying raw bytes between the client and a
/// freshly dialed upstream connection.
#[derive(Default)]
pub struct TunnelHandler {
    dial_timeout: Option<Duration>,
}

impl TunnelHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the upstream dial. The relay itself has no deadline.
    pub fn dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = Some(dial_timeout);
        self
    }

    async fn dial(&self, addr: &str) -> std::io::Result<TcpStream> {
        match self.dial_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| std::io::Error::new(ErrorKind::TimedOut, "dial timed out"))?,
            None => TcpStream::connect(addr).await,
        }
    }
}

#[async_trait]
impl Handler for TunnelHandler {
    async fn handle(&self, req: ProxyRequest, ctx: ProxyContext) -> ProxyResponse {
        ctx.set_name("tunnel");

        if req.method() != Method::CONNECT {
            ctx.set_status(StatusCode::METHOD_NOT_ALLOWED.as_u16());
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        let addr = req
            .uri()
            .authority()
            .map(|authority| authority.to_string())
            .unwrap_or_default();
        let upstream = match self.dial(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                let status = if err.kind() == ErrorKind::TimedOut {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                tracing::debug!(error = %err, %addr, "upstream dial failed");
                ctx.set_status(status.as_u16());
                return status_response(status);
            }
        };

        ctx.set_status(StatusCode::OK.as_u16());
        let relay_ctx = ctx.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => relay(TokioIo::new(upgraded), upstream, relay_ctx).await,
                Err(err) => {
                    relay_ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
                    tracing::debug!(error = %err, "connection upgrade failed");
                }
            }
        });

        Response::new(empty())
    }
}

/// Copy both directions until each side finishes. EOF and elapsed I/O
/// deadlines are normal termination; any other error ends only its own
/// direction.
async fn relay<S>(client: S, upstream: TcpStream, ctx: ProxyContext)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    let up = tokio::spawn(async move {
        let res = tokio::io::copy(&mut client_rd, &mut upstream_wr).await;
        let _ = upstream_wr.shutdown().await;
        res
    });
    let down = tokio::spawn(async move {
        let res = tokio::io::copy(&mut upstream_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        res
    });

    match up.await {
        Ok(Err(err)) if err.kind() != ErrorKind::TimedOut => {
            tracing::debug!(error = %err, "client to upstream copy error");
        }
        _ => {}
    }
    match down.await {
        Ok(Ok(n)) => ctx.set_content_length(n),
        Ok(Err(err)) if err.kind() != ErrorKind::TimedOut => {
            tracing::debug!(error = %err, "upstream to client copy error");
        }
        _ => {}
    }
}
