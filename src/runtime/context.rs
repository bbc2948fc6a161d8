//! Per-request working set handed to every compiled subroutine
//!
//! One [`VclContext`] exists per inbound request. The backend objects are
//! only populated while a fetch cycle runs; `obj` is populated on a hit or
//! once a fetch delivers.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use super::headers::Headers;

/// Raw request as received from the client connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Request method.
    pub method: String,
    /// Request target.
    pub url: String,
    /// Protocol string, e.g. `HTTP/1.1`.
    pub proto: String,
    /// Request headers in wire order.
    pub headers: Headers,
    /// Fully buffered request body.
    #[serde(skip)]
    pub body: Bytes,
    /// Address the connection was accepted on.
    pub local_addr: Option<SocketAddr>,
    /// Peer address.
    pub remote_addr: Option<SocketAddr>,
}

impl InboundRequest {
    /// Convenience constructor for a body-less request.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            proto: "HTTP/1.1".to_string(),
            ..Self::default()
        }
    }

    /// Add a header line (builder style).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the peer address (builder style).
    pub fn with_remote(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Whether `Accept-Encoding` advertises gzip.
    pub fn accepts_gzip(&self) -> bool {
        self.headers.get_all("accept-encoding").any(|value| {
            value.split(',').any(|coding| {
                let coding = coding.split(';').next().unwrap_or("").trim();
                coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip")
            })
        })
    }
}

/// Running cache-key digest.
///
/// Each contribution is fed to blake3 followed by a zero byte so that
/// `("ab", "c")` and `("a", "bc")` produce different keys.
#[derive(Debug, Clone, Default)]
pub struct RequestHash {
    hasher: blake3::Hasher,
    parts: usize,
}

impl RequestHash {
    /// Fold a value into the digest.
    pub fn add(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.hasher.update(&[0]);
        self.parts += 1;
    }

    /// Number of contributions so far.
    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Hex digest of the contributions so far.
    pub fn digest(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }

    /// Forget all contributions.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// `local.*`
#[derive(Debug, Clone, Default)]
pub struct LocalInfo {
    /// Accepting socket address.
    pub addr: Option<SocketAddr>,
    /// Listener name.
    pub socket: String,
}

/// `server.*`
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Accepting address.
    pub ip: Option<IpAddr>,
    /// Accepting port.
    pub port: u16,
    /// Host name of this node.
    pub hostname: String,
    /// Configured node identity.
    pub identity: String,
}

/// `client.*`
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    /// Peer address.
    pub ip: Option<IpAddr>,
    /// Client identity, defaults to the peer address.
    pub identity: String,
}

/// The in-flight client request (`req.*`).
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: String,
    /// Request target.
    pub url: String,
    /// Protocol string.
    pub proto: String,
    /// Header list.
    pub headers: Headers,
    /// Buffered body.
    pub body: Bytes,
    /// Accumulated cache key.
    pub hash: RequestHash,
    /// Name of the backend chosen by policy.
    pub backend_hint: Option<String>,
    /// Restart counter. Starts at -1 so the initial pass through Restart
    /// leaves it at zero.
    pub restarts: i64,
    /// ESI nesting depth.
    pub esi_level: i64,
    /// Remaining lifetime.
    pub ttl: Option<Duration>,
    /// Request identifier.
    pub xid: String,
    /// Client accepts gzip.
    pub can_gzip: bool,
    /// Force a cache miss.
    pub hash_always_miss: bool,
    /// Do not wait on in-flight fetches.
    pub hash_ignore_busy: bool,
}

impl Request {
    fn new(xid: String) -> Self {
        Self {
            method: String::new(),
            url: String::new(),
            proto: String::new(),
            headers: Headers::new(),
            body: Bytes::new(),
            hash: RequestHash::default(),
            backend_hint: None,
            restarts: -1,
            esi_level: 0,
            ttl: None,
            xid,
            can_gzip: false,
            hash_always_miss: false,
            hash_ignore_busy: false,
        }
    }
}

/// Snapshot of the top-level request (`req_top.*`).
#[derive(Debug, Clone, Default)]
pub struct TopRequest {
    /// Request method.
    pub method: String,
    /// Request target.
    pub url: String,
    /// Protocol string.
    pub proto: String,
    /// Header list.
    pub headers: Headers,
}

/// Request sent to the origin (`bereq.*`).
#[derive(Debug, Clone, Default)]
pub struct BackendRequest {
    /// Request method.
    pub method: String,
    /// Request target.
    pub url: String,
    /// Protocol string.
    pub proto: String,
    /// Header list.
    pub headers: Headers,
    /// Buffered body.
    pub body: Bytes,
    /// Attempts made so far in this fetch cycle.
    pub retries: i64,
    /// Backend chosen for the attempt.
    pub backend: Option<String>,
    /// Set for pass/pipe fetches; the result must not be cached.
    pub uncacheable: bool,
}

/// Response received from the origin (`beresp.*`).
#[derive(Debug, Clone)]
pub struct BackendResponse {
    /// Status code.
    pub status: i64,
    /// Reason phrase.
    pub reason: String,
    /// Protocol string.
    pub proto: String,
    /// Header list.
    pub headers: Headers,
    /// Buffered body.
    pub body: Bytes,
    /// Remaining lifetime.
    pub ttl: Duration,
    /// Must not be stored.
    pub uncacheable: bool,
    /// Edge-side includes requested.
    pub do_esi: bool,
    /// Name of the backend that answered.
    pub backend: Option<String>,
}

impl Default for BackendResponse {
    fn default() -> Self {
        Self {
            status: 0,
            reason: String::new(),
            proto: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
            ttl: Duration::zero(),
            uncacheable: false,
            do_esi: false,
            backend: None,
        }
    }
}

/// Cached representation of a response (`obj.*`).
#[derive(Debug, Clone)]
pub struct CacheObject {
    /// Status code.
    pub status: i64,
    /// Reason phrase.
    pub reason: String,
    /// Protocol string.
    pub proto: String,
    /// Header list.
    pub headers: Headers,
    /// Buffered body.
    pub body: Bytes,
    /// Remaining lifetime.
    pub ttl: Duration,
    /// Must not be stored.
    pub uncacheable: bool,
    /// Edge-side includes requested.
    pub do_esi: bool,
    /// When the object was last served or stored.
    pub last_used: DateTime<Utc>,
}

impl CacheObject {
    /// Build an object from a completed backend response.
    pub fn from_backend(beresp: &BackendResponse, now: DateTime<Utc>) -> Self {
        Self {
            status: beresp.status,
            reason: beresp.reason.clone(),
            proto: beresp.proto.clone(),
            headers: beresp.headers.clone(),
            body: beresp.body.clone(),
            ttl: beresp.ttl,
            uncacheable: beresp.uncacheable,
            do_esi: beresp.do_esi,
            last_used: now,
        }
    }
}

/// Outgoing response (`resp.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Status code.
    pub status: i64,
    /// Reason phrase.
    pub reason: String,
    /// Protocol string.
    pub proto: String,
    /// Header list.
    pub headers: Headers,
    /// Buffered body.
    #[serde(skip)]
    pub body: Bytes,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            reason: "OK".to_string(),
            proto: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

/// Everything a subroutine can see or touch for one request.
#[derive(Debug, Clone)]
pub struct VclContext {
    /// `local.*`
    pub local: LocalInfo,
    /// `remote.ip`
    pub remote: Option<IpAddr>,
    /// `client.*`
    pub client: ClientInfo,
    /// `server.*`
    pub server: ServerInfo,
    /// `req.*`
    pub req: Request,
    /// `req_top.*`
    pub req_top: TopRequest,
    /// `bereq.*`, present only during a fetch.
    pub bereq: Option<BackendRequest>,
    /// `beresp.*`, present once the origin answered.
    pub beresp: Option<BackendResponse>,
    /// `obj.*`, the cached object for hits and fresh fetches.
    pub obj: Option<CacheObject>,
    /// `resp.*`
    pub resp: Response,
}

impl VclContext {
    /// Fresh context for a request identified by `xid`.
    pub fn new(xid: impl Into<String>, hostname: &str, identity: &str) -> Self {
        Self {
            local: LocalInfo::default(),
            remote: None,
            client: ClientInfo::default(),
            server: ServerInfo {
                hostname: hostname.to_string(),
                identity: identity.to_string(),
                ..ServerInfo::default()
            },
            req: Request::new(xid.into()),
            req_top: TopRequest::default(),
            bereq: None,
            beresp: None,
            obj: None,
            resp: Response::default(),
        }
    }

    /// Repopulate the context from the raw inbound request.
    ///
    /// Everything derived from a previous pass (hash, backend objects,
    /// cached object, response) is discarded; the restart counter, xid and
    /// backend hint survive.
    pub fn reset_from_inbound(&mut self, inbound: &InboundRequest) {
        self.local.addr = inbound.local_addr;
        self.server.ip = inbound.local_addr.map(|addr| addr.ip());
        self.server.port = inbound.local_addr.map(|addr| addr.port()).unwrap_or(0);
        self.remote = inbound.remote_addr.map(|addr| addr.ip());
        self.client.ip = self.remote;
        self.client.identity = self
            .remote
            .map(|ip| ip.to_string())
            .unwrap_or_default();

        self.req.method = inbound.method.clone();
        self.req.url = inbound.url.clone();
        self.req.proto = inbound.proto.clone();
        self.req.headers = inbound.headers.clone();
        self.req.body = inbound.body.clone();
        self.req.can_gzip = inbound.accepts_gzip();
        self.req.hash.reset();
        self.req.hash_always_miss = false;
        self.req.hash_ignore_busy = false;
        self.req.ttl = None;

        self.req_top = TopRequest {
            method: inbound.method.clone(),
            url: inbound.url.clone(),
            proto: inbound.proto.clone(),
            headers: inbound.headers.clone(),
        };

        self.bereq = None;
        self.beresp = None;
        self.obj = None;
        self.resp = Response::default();
    }

    /// Replace the response with a synthetic status line and empty body.
    pub fn synthesize(&mut self, status: i64, reason: impl Into<String>) {
        self.resp = Response {
            status,
            reason: reason.into(),
            ..Response::default()
        };
    }

    /// Copy a cached object into the outgoing response.
    pub fn response_from_object(&mut self, obj: &CacheObject) {
        self.resp = Response {
            status: obj.status,
            reason: obj.reason.clone(),
            proto: obj.proto.clone(),
            headers: obj.headers.clone(),
            body: obj.body.clone(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_separates_contributions() {
        let mut left = RequestHash::default();
        left.add(b"ab");
        left.add(b"c");
        let mut right = RequestHash::default();
        right.add(b"a");
        right.add(b"bc");
        assert_ne!(left.digest(), right.digest());
        assert_eq!(left.parts(), 2);
    }

    #[test]
    fn reset_preserves_restart_counter_and_clears_fetch_state() {
        let inbound = InboundRequest::new("GET", "/index")
            .with_header("Accept-Encoding", "br, gzip;q=0.8")
            .with_remote("192.0.2.7:5000".parse().unwrap());
        let mut ctx = VclContext::new("x1", "node", "vclcore");
        ctx.req.restarts = 2;
        ctx.req.hash.add(b"stale");
        ctx.bereq = Some(BackendRequest::default());
        ctx.resp.status = 503;

        ctx.reset_from_inbound(&inbound);

        assert_eq!(ctx.req.restarts, 2);
        assert_eq!(ctx.req.hash.parts(), 0);
        assert!(ctx.req.can_gzip);
        assert!(ctx.bereq.is_none());
        assert_eq!(ctx.resp.status, 200);
        assert_eq!(ctx.client.identity, "192.0.2.7");
        assert_eq!(ctx.req_top.url, "/index");
    }

    #[test]
    fn gzip_detection_ignores_other_codings() {
        let inbound = InboundRequest::new("GET", "/").with_header("Accept-Encoding", "deflate, br");
        assert!(!inbound.accepts_gzip());
    }
}
