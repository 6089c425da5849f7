//! SSH agent plumbing.
//!
//! The embedder owns the real agent connection; this end presents it as a
//! named local stream socket called `"agent"`. Agent requests written by
//! the SSH engine are reframed into whole packets and posted over the
//! message bus; replies from the embedder are framed back onto the stream
//! buffer for the engine to read.

#[allow(unused_imports)]
use {
    crate::error::{Errno, Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use pretty_hex::PrettyHex;

use crate::endpoint::{FileIo, LocalStreamSocket, TargetCell};
use crate::host::{BusMessage, EmbedderBus};
use crate::stream::StreamCore;

/// The one recognized local stream socket path.
pub const AGENT_SOCKET_NAME: &str = "agent";

const HEADER_SIZE: usize = 4;

/// Reassembles length-prefixed agent packets out of a byte stream. The
/// framing is a 4-byte big-endian size followed by that many payload
/// bytes.
#[derive(Default)]
pub struct AgentPacketizer {
    buf: VecDeque<u8>,
}

impl AgentPacketizer {
    pub fn new() -> AgentPacketizer {
        AgentPacketizer::default()
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());
    }

    /// The size header of the buffered packet, or zero while the header
    /// itself is incomplete.
    fn size(&self) -> usize {
        if self.buf.len() < HEADER_SIZE {
            return 0;
        }
        let mut size = 0usize;
        for b in self.buf.iter().take(HEADER_SIZE) {
            size = (size << 8) | *b as usize;
        }
        size
    }

    /// Whether [`consume_packet`](Self::consume_packet) would return a
    /// whole packet.
    pub fn packet_available(&self) -> bool {
        self.buf.len() >= HEADER_SIZE && self.buf.len() >= HEADER_SIZE + self.size()
    }

    /// Takes one whole packet payload off the buffer, or `None` if only a
    /// partial packet is buffered.
    pub fn consume_packet(&mut self) -> Option<Vec<u8>> {
        if !self.packet_available() {
            return None;
        }
        let size = self.size();
        self.buf.drain(..HEADER_SIZE);
        Some(self.buf.drain(..size).collect())
    }

    /// Frames a payload with the size header.
    pub fn frame(payload: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(HEADER_SIZE + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        framed
    }
}

/// Where agent replies from the embedder get delivered. Holds the stream
/// buffer of the connected agent socket, if any.
#[derive(Default)]
pub struct AgentPort {
    sink: Mutex<Option<Arc<StreamCore>>>,
}

impl AgentPort {
    /// Frames one agent reply onto the connected socket's buffer.
    pub fn deliver(&self, payload: &[u8]) {
        match &*self.sink.lock().unwrap() {
            Some(stream) => stream.add_data(&AgentPacketizer::frame(payload)),
            None => debug!("agent reply arrived with no connected socket"),
        }
    }

    fn attach(&self, stream: Arc<StreamCore>) {
        *self.sink.lock().unwrap() = Some(stream);
    }

    fn detach(&self) {
        *self.sink.lock().unwrap() = None;
    }
}

/// The `"agent"` local stream socket endpoint.
pub struct AgentSocket {
    stream: Arc<StreamCore>,
    bus: Arc<dyn EmbedderBus>,
    port: Arc<AgentPort>,
    packetizer: AgentPacketizer,
    connected: bool,
}

impl AgentSocket {
    pub fn new(bus: Arc<dyn EmbedderBus>, port: Arc<AgentPort>) -> AgentSocket {
        AgentSocket {
            stream: StreamCore::new(),
            bus,
            port,
            packetizer: AgentPacketizer::new(),
            connected: false,
        }
    }
}

impl FileIo for AgentSocket {
    fn target(&self) -> &TargetCell {
        self.stream.target()
    }
}

impl LocalStreamSocket for AgentSocket {
    fn stream(&self) -> &Arc<StreamCore> {
        &self.stream
    }

    fn send(&mut self, buf: &[u8], _flags: i32) -> Result<usize, Errno> {
        if !self.connected {
            warn!("agent socket: send before connect");
            return Err(Errno::ENOTCONN);
        }
        self.packetizer.add_data(buf);
        while let Some(packet) = self.packetizer.consume_packet() {
            trace!("agent request {:?}", packet.hex_dump());
            self.bus.post(BusMessage::SshAgent(packet));
        }
        Ok(buf.len())
    }

    fn connect(&mut self, path: &str) -> Result<(), Errno> {
        if self.connected {
            warn!("agent socket: already connected");
            return Err(Errno::EISCONN);
        }
        if path != AGENT_SOCKET_NAME {
            warn!("local stream socket: path {path:?} unsupported");
            return Err(Errno::EACCES);
        }
        // The far side already lives in the embedder, so a recognized
        // connect always succeeds.
        self.connected = true;
        self.port.attach(self.stream.clone());
        self.stream.target().update_write(true);
        Ok(())
    }
}

impl Drop for AgentSocket {
    fn drop(&mut self) {
        if self.connected {
            self.port.detach();
        }
    }
}
