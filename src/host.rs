//! Boundaries to the host runtime and the embedder.
//!
//! Everything the crate needs from the sandboxed runtime arrives through
//! these traits: the async socket stack, URL fetching, host name lookup,
//! main-thread task posting, and the JavaScript-facing message bus. The
//! embedder implements them; tests substitute scripted fakes.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::posix::Posix;

/// Failure reported by a host transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    AddressUnreachable,
    Failed,
}

pub type UdpRecvDone =
    Box<dyn FnOnce(Result<(Vec<u8>, SocketAddr), TransportError>) + Send>;
pub type TcpRecvDone = Box<dyn FnOnce(Result<Vec<u8>, TransportError>) + Send>;
pub type ConnectDone = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// One host UDP socket. Completion callbacks are invoked on the main
/// thread, at most once per scheduled receive, and always from a later
/// turn, never from inside the scheduling call itself.
pub trait UdpTransport: Send {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), TransportError>;

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr)
        -> Result<usize, TransportError>;

    /// Schedules one receive of at most `buf_size` bytes.
    fn recv_from(&mut self, buf_size: usize, done: UdpRecvDone);
}

/// One host TCP socket. The host stack requires these calls to be made on
/// the main thread; completions arrive on a later turn, never from inside
/// the scheduling call itself.
pub trait TcpTransport: Send {
    fn connect(&mut self, addr: SocketAddr, done: ConnectDone);

    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Schedules one receive of at most `buf_size` bytes. An empty
    /// completion means the peer closed the stream.
    fn recv(&mut self, buf_size: usize, done: TcpRecvDone);
}

/// Creates host sockets for the facade's `socket()` call.
pub trait NetFactory: Send {
    fn udp(&self) -> Box<dyn UdpTransport>;
    fn tcp(&self) -> Box<dyn TcpTransport>;
}

/// Posts a task to the main/embedder thread, where all host APIs must be
/// driven.
pub trait MainThread: Send + Sync {
    fn post(&self, task: Box<dyn FnOnce() + Send>);
}

/// Outcome of a host-stack name lookup.
pub enum LookupResult {
    Addresses(Vec<String>),
    NotResolved,
    Failed,
}

pub type LookupDone = Box<dyn FnOnce(LookupResult) + Send>;

/// Host-stack name lookup. Addresses only; no record-type queries.
pub trait HostLookup: Send + Sync {
    fn lookup(&self, name: &str, want_ipv6: bool, done: LookupDone);
}

/// Outcome of a URL fetch.
pub enum FetchResult {
    Response { status: u16, body: Vec<u8> },
    Failed,
}

pub type FetchDone = Box<dyn FnOnce(FetchResult) + Send>;

/// Host URL loader, used by the DNS-over-HTTPS resolver.
pub trait UrlFetcher: Send + Sync {
    fn get(&self, url: &str, done: FetchDone);
}

/// Known-hosts dictionary synchronized with the embedder: maps
/// `host:port` to a stored key fingerprint.
pub type KnownHosts = BTreeMap<String, String>;

/// Message posted to the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    Display(String),
    Log(String),
    Error(String),
    GetSshKey,
    SyncGetKnownHosts,
    SyncSetKnownHosts(KnownHosts),
    SshAgent(Vec<u8>),
    Exit,
}

impl BusMessage {
    /// The `type` field of the wire dictionary.
    pub fn type_name(&self) -> &'static str {
        match self {
            BusMessage::Display(_) => "display",
            BusMessage::Log(_) => "log",
            BusMessage::Error(_) => "error",
            BusMessage::GetSshKey => "get_ssh_key",
            BusMessage::SyncGetKnownHosts => "sync_get_known_hosts",
            BusMessage::SyncSetKnownHosts(_) => "sync_set_known_hosts",
            BusMessage::SshAgent(_) => "ssh-agent",
            BusMessage::Exit => "exit",
        }
    }
}

/// The JavaScript-facing message bus.
pub trait EmbedderBus: Send + Sync {
    fn post(&self, msg: BusMessage);
}

/// Entry point of the vendored Mosh transport, run on its own thread with
/// the facade and an argv of `["mosh-client", addr, port]`.
pub type MoshEntry = Box<dyn FnOnce(Arc<Posix>, Vec<String>) + Send>;

/// Creates SSH engines, one per session. The engine's socket traffic must
/// go through the facade it is given elsewhere; this crate never sees it.
pub trait SshEngineFactory: Send + Sync {
    fn open(&self) -> Box<dyn crate::ssh::SshEngine>;
}
