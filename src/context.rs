use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use http::Method;
use uuid::Uuid;

/// Allocates per-request contexts and their sequence numbers.
///
/// One factory exists per server instance so that sequence numbers stay
/// monotonic across every conversation the server handles, including
/// sub-requests spawned by interception.
pub struct ContextFactory {
    seq: AtomicU64,
    access_log: bool,
}

impl ContextFactory {
    pub fn new(access_log: bool) -> Arc<Self> {
        Arc::new(Self {
            seq: AtomicU64::new(0),
            access_log,
        })
    }

    /// Create a fresh top-level context for an accepted request.
    pub fn context(
        self: &Arc<Self>,
        client: SocketAddr,
        method: Method,
        target: String,
    ) -> ProxyContext {
        ProxyContext {
            inner: Arc::new(ContextInner {
                factory: self.clone(),
                uid: Uuid::new_v4(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
                client,
                method,
                target,
                parent: None,
                name: OnceLock::new(),
                start: Instant::now(),
                status: AtomicU16::new(0),
                content_length: AtomicU64::new(0),
            }),
        }
    }
}

/// Per-request state bag carried alongside a proxied request.
///
/// Cheap to clone. The `status` and `content_length` slots are set late,
/// once the handler knows how the conversation ended. The access log entry
/// for the request is emitted exactly once, when the last clone is dropped.
#[derive(Clone)]
pub struct ProxyContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    factory: Arc<ContextFactory>,
    uid: Uuid,
    seq: u64,
    client: SocketAddr,
    method: Method,
    target: String,
    parent: Option<(u64, Uuid)>,
    name: OnceLock<&'static str>,
    start: Instant,
    status: AtomicU16,
    content_length: AtomicU64,
}

impl ProxyContext {
    /// Derive a context for a sub-request intercepted within this
    /// conversation. The child gets its own identity and sequence number
    /// and keeps a link back to this context.
    pub fn child(&self, method: Method, target: String) -> ProxyContext {
        let factory = &self.inner.factory;
        ProxyContext {
            inner: Arc::new(ContextInner {
                factory: factory.clone(),
                uid: Uuid::new_v4(),
                seq: factory.seq.fetch_add(1, Ordering::Relaxed) + 1,
                client: self.inner.client,
                method,
                target,
                parent: Some((self.inner.seq, self.inner.uid)),
                name: OnceLock::new(),
                start: Instant::now(),
                status: AtomicU16::new(0),
                content_length: AtomicU64::new(0),
            }),
        }
    }

    /// Tag the context with the name of the handler serving it.
    pub fn set_name(&self, name: &'static str) {
        let _ = self.inner.name.set(name);
    }

    pub fn uid(&self) -> Uuid {
        self.inner.uid
    }

    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    pub fn client(&self) -> SocketAddr {
        self.inner.client
    }

    pub fn parent(&self) -> Option<(u64, Uuid)> {
        self.inner.parent
    }

    pub fn set_status(&self, status: u16) {
        self.inner.status.store(status, Ordering::Relaxed);
    }

    pub fn status(&self) -> u16 {
        self.inner.status.load(Ordering::Relaxed)
    }

    pub fn set_content_length(&self, n: u64) {
        self.inner.content_length.store(n, Ordering::Relaxed);
    }

    /// Add forwarded bytes to the running total. Used by the streaming
    /// relay paths which observe the body chunk by chunk.
    pub fn add_content_length(&self, n: u64) {
        self.inner.content_length.fetch_add(n, Ordering::Relaxed);
    }

    pub fn content_length(&self) -> u64 {
        self.inner.content_length.load(Ordering::Relaxed)
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if !self.factory.access_log {
            return;
        }
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let handler = self.name.get().copied().unwrap_or("-");
        match self.parent {
            Some((parent_seq, parent_uid)) => tracing::info!(
                target: "access",
                seq = self.seq,
                uid = %self.uid,
                handler,
                client = %self.client,
                method = %self.method,
                target = %self.target,
                parent_seq,
                parent_uid = %parent_uid,
                status = self.status.load(Ordering::Relaxed),
                content_length = self.content_length.load(Ordering::Relaxed),
                duration_ms,
            ),
            None => tracing::info!(
                target: "access",
                seq = self.seq,
                uid = %self.uid,
                handler,
                client = %self.client,
                method = %self.method,
                target = %self.target,
                status = self.status.load(Ordering::Relaxed),
                content_length = self.content_length.load(Ordering::Relaxed),
                duration_ms,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn sequence_is_monotonic() {
        let factory = ContextFactory::new(false);
        let a = factory.context(addr(), Method::GET, "http://a/".into());
        let b = factory.context(addr(), Method::GET, "http://b/".into());
        assert!(b.seq() > a.seq());
    }

    #[test]
    fn child_links_to_parent() {
        let factory = ContextFactory::new(false);
        let parent = factory.context(addr(), Method::CONNECT, "example.com:443".into());
        let child = parent.child(Method::GET, "https://example.com/".into());

        assert_eq!(child.parent(), Some((parent.seq(), parent.uid())));
        assert_eq!(child.client(), parent.client());
        assert!(child.seq() > parent.seq());
        assert_ne!(child.uid(), parent.uid());
    }

    #[test]
    fn content_length_accumulates() {
        let factory = ContextFactory::new(false);
        let ctx = factory.context(addr(), Method::GET, "http://a/".into());
        ctx.add_content_length(10);
        ctx.add_content_length(32);
        assert_eq!(ctx.content_length(), 42);

        ctx.set_content_length(7);
        assert_eq!(ctx.content_length(), 7);
    }
}
