//! Packetized receive path for datagram sockets.
//!
//! Each received packet keeps its source address and owns its payload end
//! to end. Packet boundaries are preserved: one `receive` consumes exactly
//! one packet.

#[allow(unused_imports)]
use {
    crate::error::{Errno, Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::endpoint::TargetCell;

pub struct Packet {
    pub source: SocketAddr,
    pub payload: Vec<u8>,
}

pub struct DatagramQueue {
    packets: Mutex<VecDeque<Packet>>,
    target: TargetCell,
}

impl DatagramQueue {
    pub fn new() -> Arc<DatagramQueue> {
        Arc::new(DatagramQueue {
            packets: Mutex::new(VecDeque::new()),
            target: TargetCell::new(),
        })
    }

    pub fn target(&self) -> &TargetCell {
        &self.target
    }

    /// Appends a packet to the incoming queue. Safe to call from a thread
    /// other than the consumer's; raises the read-ready edge.
    pub fn add_packet(&self, packet: Packet) {
        {
            let mut packets = self.packets.lock().unwrap();
            packets.push_back(packet);
        }
        self.target.update_read(true);
    }

    /// Pops one packet, gathering its payload into the caller's buffer
    /// set. Returns the copied length and the packet's source address. A
    /// buffer set too small for the payload truncates with a warning.
    pub fn receive(
        &self,
        bufs: &mut [&mut [u8]],
    ) -> Result<(usize, SocketAddr), Errno> {
        let packet = {
            let mut packets = self.packets.lock().unwrap();
            let Some(packet) = packets.pop_front() else {
                return Err(Errno::EWOULDBLOCK);
            };
            self.target.update_read(!packets.is_empty());
            packet
        };

        let mut copied = 0;
        for buf in bufs.iter_mut() {
            if copied == packet.payload.len() {
                break;
            }
            let n = buf.len().min(packet.payload.len() - copied);
            buf[..n].copy_from_slice(&packet.payload[copied..copied + n]);
            copied += n;
        }
        if copied < packet.payload.len() {
            warn!(
                "datagram receive: buffer set too small, dropped {} bytes",
                packet.payload.len() - copied
            );
        }

        Ok((copied, packet.source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moshlog::init_test_log;

    fn addr(port: u16) -> SocketAddr {
        format!("192.0.2.1:{port}").parse().unwrap()
    }

    #[test]
    fn boundaries_are_preserved() {
        init_test_log();
        let queue = DatagramQueue::new();
        queue.add_packet(Packet { source: addr(1), payload: b"first".to_vec() });
        queue.add_packet(Packet { source: addr(2), payload: b"second".to_vec() });

        let mut buf = [0u8; 64];
        let (n, source) = queue.receive(&mut [&mut buf]).unwrap();
        assert_eq!(&buf[..n], b"first");
        assert_eq!(source, addr(1));

        let (n, source) = queue.receive(&mut [&mut buf]).unwrap();
        assert_eq!(&buf[..n], b"second");
        assert_eq!(source, addr(2));

        assert_eq!(queue.receive(&mut [&mut buf]), Err(Errno::EWOULDBLOCK));
    }

    #[test]
    fn payload_gathers_across_buffers() {
        init_test_log();
        let queue = DatagramQueue::new();
        queue.add_packet(Packet { source: addr(9), payload: b"abcdefg".to_vec() });

        let mut a = [0u8; 3];
        let mut b = [0u8; 16];
        let (n, _) = queue.receive(&mut [&mut a, &mut b]).unwrap();
        assert_eq!(n, 7);
        assert_eq!(&a, b"abc");
        assert_eq!(&b[..4], b"defg");
    }

    #[test]
    fn short_buffer_truncates() {
        init_test_log();
        let queue = DatagramQueue::new();
        queue.add_packet(Packet { source: addr(3), payload: b"oversize".to_vec() });
        let mut small = [0u8; 4];
        let (n, _) = queue.receive(&mut [&mut small]).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&small, b"over");
    }

    #[test]
    fn readiness_tracks_queue_depth() {
        init_test_log();
        let selector = crate::selector::Selector::new();
        let queue = DatagramQueue::new();
        queue.target().attach(selector.new_target(6));

        queue.add_packet(Packet { source: addr(1), payload: vec![1] });
        queue.add_packet(Packet { source: addr(1), payload: vec![2] });
        assert!(queue.target().has_read_data());

        let mut buf = [0u8; 4];
        queue.receive(&mut [&mut buf]).unwrap();
        assert!(queue.target().has_read_data());
        queue.receive(&mut [&mut buf]).unwrap();
        assert!(!queue.target().has_read_data());
    }
}
