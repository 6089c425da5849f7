//! Endpoint capabilities held in the descriptor table.
//!
//! Every descriptor maps to one [`Endpoint`] variant. The facade dispatches
//! each operation by matching the capability it needs; an endpoint that
//! lacks the capability yields `EBADF`, the same answer POSIX gives for a
//! descriptor of the wrong kind.

#[allow(unused_imports)]
use {
    crate::error::{Errno, Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use crate::datagram::DatagramQueue;
use crate::selector::Target;
use crate::stream::StreamCore;

/// Slot for the readiness handle, attached when the endpoint is installed
/// in the descriptor table. Readiness updates before attachment are
/// dropped; nothing can be selecting on an endpoint that has no descriptor
/// yet.
#[derive(Default)]
pub struct TargetCell(OnceLock<Target>);

impl TargetCell {
    pub fn new() -> Self {
        TargetCell(OnceLock::new())
    }

    pub fn attach(&self, target: Target) {
        if self.0.set(target).is_err() {
            debug_assert!(false, "endpoint registered twice");
        }
    }

    pub fn get(&self) -> Option<&Target> {
        self.0.get()
    }

    pub fn update_read(&self, has_data: bool) {
        if let Some(t) = self.0.get() {
            t.update_read(has_data);
        }
    }

    pub fn update_write(&self, has_data: bool) {
        if let Some(t) = self.0.get() {
            t.update_write(has_data);
        }
    }

    pub fn has_read_data(&self) -> bool {
        self.0.get().is_some_and(|t| t.has_read_data())
    }

    pub fn has_write_data(&self) -> bool {
        self.0.get().is_some_and(|t| t.has_write_data())
    }
}

/// Base capability common to every endpoint.
pub trait FileIo: Send {
    /// The endpoint's readiness slot.
    fn target(&self) -> &TargetCell;

    /// Called right after the endpoint lands in the descriptor table,
    /// with its target attached. Endpoints that are ready from the start
    /// raise their edge here.
    fn on_install(&self) {}

    /// Called when the descriptor is closed, before the endpoint is
    /// dropped.
    fn on_close(&mut self) {}
}

/// An endpoint that produces bytes.
pub trait Reader: FileIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Errno>;
}

/// An endpoint that consumes bytes.
pub trait Writer: FileIo {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Errno>;
}

/// Signal delivery endpoint. Raise read-readiness on its target when a
/// signal is outstanding; [`handle`](SignalSource::handle) runs from
/// `pselect` and must lower the flag once nothing is pending.
pub trait SignalSource: FileIo {
    fn handle(&mut self);
}

/// A connected byte-stream socket (TCP).
pub trait StreamSocket: FileIo {
    /// The shared receive buffer, also reachable from completion callbacks.
    fn stream(&self) -> &Arc<StreamCore>;

    fn send(&mut self, buf: &[u8], flags: i32) -> Result<usize, Errno>;

    fn connect(&mut self, addr: SocketAddr) -> Result<(), Errno>;
}

/// A datagram socket (UDP).
pub trait DatagramSocket: FileIo {
    /// The shared packet queue, also reachable from completion callbacks.
    fn queue(&self) -> &Arc<DatagramQueue>;

    fn send_to(&mut self, buf: Vec<u8>, flags: i32, addr: SocketAddr)
        -> Result<usize, Errno>;

    fn bind(&mut self, addr: SocketAddr) -> Result<(), Errno>;
}

/// A named local stream socket, connected by path instead of address.
pub trait LocalStreamSocket: FileIo {
    fn stream(&self) -> &Arc<StreamCore>;

    fn send(&mut self, buf: &[u8], flags: i32) -> Result<usize, Errno>;

    fn connect(&mut self, path: &str) -> Result<(), Errno>;
}

/// The polymorphic resource behind a descriptor.
pub enum Endpoint {
    StreamSocket(Box<dyn StreamSocket>),
    DatagramSocket(Box<dyn DatagramSocket>),
    NamedLocalStream(Box<dyn LocalStreamSocket>),
    StdinReader(Box<dyn Reader>),
    StdoutWriter(Box<dyn Writer>),
    StderrWriter(Box<dyn Writer>),
    SignalSource(Box<dyn SignalSource>),
    RandomReader(Box<dyn Reader>),
}

impl Endpoint {
    pub fn target(&self) -> &TargetCell {
        match self {
            Endpoint::StreamSocket(e) => e.target(),
            Endpoint::DatagramSocket(e) => e.target(),
            Endpoint::NamedLocalStream(e) => e.target(),
            Endpoint::StdinReader(e) => e.target(),
            Endpoint::StdoutWriter(e) => e.target(),
            Endpoint::StderrWriter(e) => e.target(),
            Endpoint::SignalSource(e) => e.target(),
            Endpoint::RandomReader(e) => e.target(),
        }
    }

    pub(crate) fn on_install(&self) {
        match self {
            Endpoint::StreamSocket(e) => e.on_install(),
            Endpoint::DatagramSocket(e) => e.on_install(),
            Endpoint::NamedLocalStream(e) => e.on_install(),
            Endpoint::StdinReader(e) => e.on_install(),
            Endpoint::StdoutWriter(e) => e.on_install(),
            Endpoint::StderrWriter(e) => e.on_install(),
            Endpoint::SignalSource(e) => e.on_install(),
            Endpoint::RandomReader(e) => e.on_install(),
        }
    }

    pub(crate) fn on_close(&mut self) {
        match self {
            Endpoint::StreamSocket(e) => e.on_close(),
            Endpoint::DatagramSocket(e) => e.on_close(),
            Endpoint::NamedLocalStream(e) => e.on_close(),
            Endpoint::StdinReader(e) => e.on_close(),
            Endpoint::StdoutWriter(e) => e.on_close(),
            Endpoint::StderrWriter(e) => e.on_close(),
            Endpoint::SignalSource(e) => e.on_close(),
            Endpoint::RandomReader(e) => e.on_close(),
        }
    }

    pub(crate) fn can_read(&self) -> bool {
        matches!(
            self,
            Endpoint::StdinReader(_)
                | Endpoint::RandomReader(_)
                | Endpoint::StreamSocket(_)
                | Endpoint::NamedLocalStream(_)
        )
    }

    pub(crate) fn can_write(&self) -> bool {
        matches!(
            self,
            Endpoint::StdoutWriter(_)
                | Endpoint::StderrWriter(_)
                | Endpoint::StreamSocket(_)
                | Endpoint::NamedLocalStream(_)
        )
    }

    /// `read()` capability: readers and both stream kinds.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        match self {
            Endpoint::StdinReader(r) | Endpoint::RandomReader(r) => r.read(buf),
            Endpoint::StreamSocket(s) => s.stream().receive(buf, 0),
            Endpoint::NamedLocalStream(s) => s.stream().receive(buf, 0),
            _ => Err(Errno::EBADF),
        }
    }

    /// `write()` capability: writers and both stream kinds.
    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<usize, Errno> {
        match self {
            Endpoint::StdoutWriter(w) | Endpoint::StderrWriter(w) => {
                w.write(buf)
            }
            Endpoint::StreamSocket(s) => s.send(buf, 0),
            Endpoint::NamedLocalStream(s) => s.send(buf, 0),
            _ => Err(Errno::EBADF),
        }
    }
}
