//! Adaptation layer for running the Mosh client inside a sandboxed plugin
//! runtime.
//!
//! The heart of the crate is a POSIX-over-callbacks emulation: a
//! descriptor table and syscall facade ([`posix`]) whose blocking calls
//! park on a readiness selector ([`selector`]) until the host's async
//! completions feed the buffered endpoints ([`stream`], [`datagram`]).
//! On top of that sit the SSH bootstrap that negotiates a Mosh handshake
//! ([`login`]), pluggable name resolution with SSHFP validation
//! ([`resolver`], [`gpdns`], [`sshfp`]), and the client instance gluing it
//! all to the embedder ([`instance`]).

#![forbid(unsafe_code)]
// avoids headscratching
#![deny(unused_must_use)]

pub mod agent;
pub mod config;
pub mod datagram;
pub mod endpoint;
pub mod error;
pub mod gpdns;
pub mod host;
pub mod instance;
pub mod login;
pub mod moshlog;
pub mod native;
pub mod posix;
pub mod resolver;
pub mod selector;
pub mod ssh;
pub mod sshfp;
pub mod stream;
pub mod termio;

// Embedder API
pub use config::Config;
pub use error::{Errno, Error, Result};
pub use host::{
    BusMessage, EmbedderBus, HostLookup, KnownHosts, MainThread, MoshEntry,
    NetFactory, SshEngineFactory, TcpTransport, UdpTransport, UrlFetcher,
};
pub use instance::{HostHooks, InMessage, MoshInstance};
pub use moshlog::BusLogger;
pub use posix::Posix;
pub use resolver::{Authenticity, QueryType, Resolver};
pub use ssh::{Key, KeyType, SshEngine};
pub use sshfp::{RecordSet, Validity};
