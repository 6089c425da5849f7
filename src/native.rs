//! Adapters between the buffered endpoints and the host's async socket
//! stack.
//!
//! The host API never blocks: sends complete inline, receives complete
//! through callbacks on the main thread. Each adapter chains one receive
//! into the next so there is always at most one outstanding, and feeds
//! completions into the shared stream buffer or packet queue, which raises
//! the readiness edge the worker thread is parked on.

#[allow(unused_imports)]
use {
    crate::error::{Errno, Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use crate::datagram::{DatagramQueue, Packet};
use crate::endpoint::{DatagramSocket, FileIo, StreamSocket, TargetCell};
use crate::host::{MainThread, TcpTransport, TransportError, UdpTransport};
use crate::stream::StreamCore;

/// One typical MTU.
const UDP_RECV_BUF: usize = 1500;
const TCP_RECV_BUF: usize = 64 * 1024;

fn map_transport_err(e: TransportError) -> Errno {
    match e {
        TransportError::AddressUnreachable => Errno::EHOSTUNREACH,
        // Not precise, but always set something.
        TransportError::Failed => Errno::EIO,
    }
}

/// A closed adapter holds `None`; pending completions then stop the chain.
type SharedUdp = Arc<Mutex<Option<Box<dyn UdpTransport>>>>;
type SharedTcp = Arc<Mutex<Option<Box<dyn TcpTransport>>>>;

pub struct NativeUdp {
    queue: Arc<DatagramQueue>,
    transport: SharedUdp,
    main: Arc<dyn MainThread>,
    bound: bool,
}

impl NativeUdp {
    pub fn new(transport: Box<dyn UdpTransport>, main: Arc<dyn MainThread>) -> NativeUdp {
        NativeUdp {
            queue: DatagramQueue::new(),
            transport: Arc::new(Mutex::new(Some(transport))),
            main,
            bound: false,
        }
    }
}

fn udp_start_receive(transport: &SharedUdp, queue: &Arc<DatagramQueue>) {
    let mut guard = transport.lock().unwrap();
    let Some(t) = guard.as_mut() else { return };
    let transport = transport.clone();
    let queue = queue.clone();
    t.recv_from(
        UDP_RECV_BUF,
        Box::new(move |result| match result {
            Ok((payload, source)) => {
                queue.add_packet(Packet { source, payload });
                // Await another packet.
                udp_start_receive(&transport, &queue);
            }
            Err(e) => {
                warn!("udp receive failed: {e:?}; stopping receive chain");
            }
        }),
    );
}

impl FileIo for NativeUdp {
    fn target(&self) -> &TargetCell {
        self.queue.target()
    }

    fn on_close(&mut self) {
        // Dropping the host socket is the same as closing it.
        *self.transport.lock().unwrap() = None;
    }
}

impl DatagramSocket for NativeUdp {
    fn queue(&self) -> &Arc<DatagramQueue> {
        &self.queue
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<(), Errno> {
        let result = match self.transport.lock().unwrap().as_mut() {
            Some(t) => t.bind(addr),
            None => return Err(Errno::EBADF),
        };
        match result {
            Ok(()) => {
                self.bound = true;
                let transport = self.transport.clone();
                let queue = self.queue.clone();
                self.main.post(Box::new(move || {
                    udp_start_receive(&transport, &queue);
                }));
                Ok(())
            }
            Err(e) => Err(map_transport_err(e)),
        }
    }

    fn send_to(
        &mut self,
        buf: Vec<u8>,
        _flags: i32,
        addr: SocketAddr,
    ) -> Result<usize, Errno> {
        if !self.bound {
            // Late bind to the "any" address of the destination's family.
            let any: SocketAddr = match addr {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            if let Err(e) = self.bind(any) {
                warn!("udp send: implicit bind failed: {e}");
                return Ok(0);
            }
        }

        let mut guard = self.transport.lock().unwrap();
        let Some(t) = guard.as_mut() else { return Err(Errno::EBADF) };
        t.send_to(&buf, addr).map_err(map_transport_err)
    }
}

pub struct NativeTcp {
    stream: Arc<StreamCore>,
    transport: SharedTcp,
    main: Arc<dyn MainThread>,
}

impl NativeTcp {
    pub fn new(transport: Box<dyn TcpTransport>, main: Arc<dyn MainThread>) -> NativeTcp {
        NativeTcp {
            stream: StreamCore::new(),
            transport: Arc::new(Mutex::new(Some(transport))),
            main,
        }
    }
}

fn tcp_start_receive(transport: &SharedTcp, stream: &Arc<StreamCore>) {
    let mut guard = transport.lock().unwrap();
    let Some(t) = guard.as_mut() else { return };
    let transport = transport.clone();
    let stream = stream.clone();
    t.recv(
        TCP_RECV_BUF,
        Box::new(move |result| match result {
            Ok(data) if data.is_empty() => {
                // Peer closed; wake any reader and stop.
                debug!("tcp stream closed by peer");
                stream.target().update_read(true);
            }
            Ok(data) => {
                stream.add_data(&data);
                tcp_start_receive(&transport, &stream);
            }
            Err(e) => {
                warn!("tcp receive failed: {e:?}; stopping receive chain");
            }
        }),
    );
}

impl FileIo for NativeTcp {
    fn target(&self) -> &TargetCell {
        self.stream.target()
    }

    fn on_close(&mut self) {
        *self.transport.lock().unwrap() = None;
    }
}

impl StreamSocket for NativeTcp {
    fn stream(&self) -> &Arc<StreamCore> {
        &self.stream
    }

    fn send(&mut self, buf: &[u8], flags: i32) -> Result<usize, Errno> {
        if flags != 0 {
            warn!("tcp send: unsupported flags {flags:#x}");
        }
        let mut guard = self.transport.lock().unwrap();
        let Some(t) = guard.as_mut() else { return Err(Errno::EBADF) };
        t.send(buf).map_err(map_transport_err)
    }

    /// The host stack requires main-thread calls, so the connect is posted
    /// there and `EINPROGRESS` returned; completion either raises
    /// write-readiness and starts the receive loop, or stores a connection
    /// errno for a later `SO_ERROR` query.
    fn connect(&mut self, addr: SocketAddr) -> Result<(), Errno> {
        let transport = self.transport.clone();
        let stream = self.stream.clone();
        self.main.post(Box::new(move || {
            let mut guard = transport.lock().unwrap();
            let Some(t) = guard.as_mut() else { return };
            let transport2 = transport.clone();
            let stream2 = stream.clone();
            t.connect(
                addr,
                Box::new(move |result| match result {
                    Ok(()) => {
                        stream2.target().update_write(true);
                        tcp_start_receive(&transport2, &stream2);
                    }
                    Err(e) => {
                        warn!("tcp connect failed: {e:?}");
                        stream2.set_conn_errno(map_transport_err(e));
                    }
                }),
            );
        }));
        Err(Errno::EINPROGRESS)
    }
}
