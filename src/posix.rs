//! The descriptor table and syscall facade.
//!
//! [`Posix`] maps small integer descriptors to polymorphic endpoints and
//! dispatches the read/write/socket/select family of calls onto them. A
//! blocking operation parks the calling thread on the selector and then
//! re-invokes the endpoint's non-blocking primitive; everything else is a
//! straight dispatch. The facade is driven from the single worker thread;
//! the interior mutex exists for initialization and `Sync`.

#[allow(unused_imports)]
use {
    crate::error::{Errno, Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::endpoint::{Endpoint, LocalStreamSocket, Reader, SignalSource, Writer};
use crate::host::{MainThread, NetFactory};
use crate::native::{NativeTcp, NativeUdp};
use crate::selector::{Selector, Target, SIGNAL_ID};

pub const AF_UNIX: i32 = 1;
pub const AF_INET: i32 = 2;
pub const AF_INET6: i32 = 10;

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;

pub const IPPROTO_TCP: i32 = 6;
pub const IPPROTO_UDP: i32 = 17;

pub const MSG_PEEK: i32 = 0x2;
pub const MSG_DONTWAIT: i32 = 0x40;

pub const O_NONBLOCK: i32 = 0o4000;
pub const FD_CLOEXEC: i32 = 1;

pub const SOL_SOCKET: i32 = 1;
pub const SO_ERROR: i32 = 4;

pub const POLLIN: i16 = 0x1;
pub const POLLPRI: i16 = 0x2;
pub const POLLOUT: i16 = 0x4;
pub const POLLERR: i16 = 0x8;
pub const POLLHUP: i16 = 0x10;
pub const POLLNVAL: i16 = 0x20;

/// Destination for `connect()`.
pub enum SockAddr {
    Inet(SocketAddr),
    /// Named local stream socket path.
    Local(String),
}

/// `fcntl()` commands the facade understands.
pub enum FcntlCmd {
    SetFl(i32),
    SetFd(i32),
}

/// Descriptor set for `pselect()`/`select()`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FdSet {
    fds: BTreeSet<i32>,
}

impl FdSet {
    pub fn new() -> FdSet {
        FdSet::default()
    }

    pub fn set(&mut self, fd: i32) {
        self.fds.insert(fd);
    }

    pub fn unset(&mut self, fd: i32) {
        self.fds.remove(&fd);
    }

    pub fn contains(&self, fd: i32) -> bool {
        self.fds.contains(&fd)
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

/// `poll()` entry.
#[derive(Debug, Clone)]
pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

pub type EndpointFactory = Box<dyn FnMut() -> Endpoint + Send>;
pub type LocalStreamFactory =
    Box<dyn FnMut() -> Box<dyn LocalStreamSocket> + Send>;

struct FileEntry {
    endpoint: Endpoint,
    blocking: bool,
}

struct Inner {
    files: BTreeMap<i32, FileEntry>,
    signal: Option<Box<dyn SignalSource>>,
    factories: BTreeMap<String, EndpointFactory>,
    local_factory: Option<LocalStreamFactory>,
    net: Box<dyn NetFactory>,
    main: Arc<dyn MainThread>,
}

pub struct Posix {
    // Declared before the selector: endpoints (and their targets) must be
    // gone before the selector is dropped.
    inner: Mutex<Inner>,
    selector: Selector,
}

impl Posix {
    /// Builds the table with the three standard endpoints on descriptors
    /// 0/1/2 and an optional signal pseudo-endpoint outside the issuance
    /// range.
    pub fn new(
        net: Box<dyn NetFactory>,
        main: Arc<dyn MainThread>,
        stdin: Box<dyn Reader>,
        stdout: Box<dyn Writer>,
        stderr: Box<dyn Writer>,
        signal: Option<Box<dyn SignalSource>>,
    ) -> Posix {
        let selector = Selector::new();
        stdin.target().attach(selector.new_target(0));
        stdout.target().attach(selector.new_target(1));
        stderr.target().attach(selector.new_target(2));
        if let Some(sig) = &signal {
            sig.target().attach(selector.new_target(SIGNAL_ID));
        }

        let mut files = BTreeMap::new();
        files.insert(0, FileEntry { endpoint: Endpoint::StdinReader(stdin), blocking: true });
        files.insert(1, FileEntry { endpoint: Endpoint::StdoutWriter(stdout), blocking: true });
        files.insert(2, FileEntry { endpoint: Endpoint::StderrWriter(stderr), blocking: true });

        Posix {
            inner: Mutex::new(Inner {
                files,
                signal,
                factories: BTreeMap::new(),
                local_factory: None,
                net,
                main,
            }),
            selector,
        }
    }

    /// Registers a factory producing the endpoint for `path`.
    pub fn register_file(&self, path: &str, factory: EndpointFactory) {
        self.inner.lock().unwrap().factories.insert(path.into(), factory);
    }

    /// Registers the factory used for every named local stream socket.
    pub fn register_local_stream(&self, factory: LocalStreamFactory) {
        self.inner.lock().unwrap().local_factory = Some(factory);
    }

    pub fn open(&self, path: &str) -> Result<i32, Errno> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let Some(factory) = inner.factories.get_mut(path) else {
            return Err(Errno::EACCES);
        };
        let endpoint = factory();
        Ok(self.install(&mut inner.files, endpoint, false))
    }

    pub fn close(&self, fd: i32) -> Result<(), Errno> {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut entry) = inner.files.remove(&fd) else {
            return Err(Errno::EBADF);
        };
        entry.endpoint.on_close();
        Ok(())
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut inner = self.inner.lock().unwrap();
        {
            let entry = inner.files.get(&fd).ok_or(Errno::EBADF)?;
            if !entry.endpoint.can_read() {
                return Err(Errno::EBADF);
            }
            if entry.blocking {
                if let Some(t) = entry.endpoint.target().get() {
                    self.selector.select(&[t], &[], None);
                }
            }
        }
        inner.files.get_mut(&fd).ok_or(Errno::EBADF)?.endpoint.read(buf)
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> Result<usize, Errno> {
        let mut inner = self.inner.lock().unwrap();
        {
            let entry = inner.files.get(&fd).ok_or(Errno::EBADF)?;
            if !entry.endpoint.can_write() {
                return Err(Errno::EBADF);
            }
            if entry.blocking {
                if let Some(t) = entry.endpoint.target().get() {
                    self.selector.select(&[], &[t], None);
                }
            }
        }
        inner.files.get_mut(&fd).ok_or(Errno::EBADF)?.endpoint.write(buf)
    }

    pub fn socket(&self, domain: i32, sock_type: i32, protocol: i32) -> Result<i32, Errno> {
        let mut inner = self.inner.lock().unwrap();
        self.socket_locked(&mut inner, domain, sock_type, protocol)
    }

    fn socket_locked(
        &self,
        inner: &mut Inner,
        domain: i32,
        sock_type: i32,
        protocol: i32,
    ) -> Result<i32, Errno> {
        let endpoint = if domain == AF_UNIX && protocol == 0 {
            if sock_type != SOCK_STREAM {
                return Err(Errno::EINVAL);
            }
            let factory = inner.local_factory.as_mut().ok_or(Errno::EINVAL)?;
            Endpoint::NamedLocalStream(factory())
        } else {
            if domain != AF_INET && domain != AF_INET6 {
                return Err(Errno::EINVAL);
            }
            if sock_type == SOCK_DGRAM && (protocol == 0 || protocol == IPPROTO_UDP) {
                Endpoint::DatagramSocket(Box::new(NativeUdp::new(
                    inner.net.udp(),
                    inner.main.clone(),
                )))
            } else if sock_type == SOCK_STREAM
                && (protocol == 0 || protocol == IPPROTO_TCP)
            {
                Endpoint::StreamSocket(Box::new(NativeTcp::new(
                    inner.net.tcp(),
                    inner.main.clone(),
                )))
            } else {
                return Err(Errno::EINVAL);
            }
        };

        Ok(self.install(&mut inner.files, endpoint, sock_type == SOCK_STREAM))
    }

    fn install(
        &self,
        files: &mut BTreeMap<i32, FileEntry>,
        endpoint: Endpoint,
        stream: bool,
    ) -> i32 {
        let fd = (0..).find(|fd| !files.contains_key(fd)).unwrap();
        endpoint.target().attach(self.selector.new_target(fd));
        if stream {
            // Stream sockets are not writable until the transport reports
            // the connection open.
            endpoint.target().update_write(false);
        }
        endpoint.on_install();
        files.insert(fd, FileEntry { endpoint, blocking: true });
        fd
    }

    /// Only datagram sockets can be duplicated; the duplicate is a fresh
    /// IPv4 datagram endpoint.
    pub fn dup(&self, oldfd: i32) -> Result<i32, Errno> {
        let mut inner = self.inner.lock().unwrap();
        match inner.files.get(&oldfd) {
            Some(entry) if matches!(entry.endpoint, Endpoint::DatagramSocket(_)) => {}
            Some(_) => return Err(Errno::EBADF),
            None => return Err(Errno::EBADF),
        }
        self.socket_locked(&mut inner, AF_INET, SOCK_DGRAM, 0)
    }

    pub fn connect(&self, fd: i32, addr: &SockAddr) -> Result<(), Errno> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.files.get_mut(&fd).ok_or(Errno::EBADF)?;
        match (&mut entry.endpoint, addr) {
            (Endpoint::StreamSocket(s), SockAddr::Inet(a)) => s.connect(*a),
            (Endpoint::NamedLocalStream(s), SockAddr::Local(path)) => {
                s.connect(path)
            }
            _ => Err(Errno::EBADF),
        }
    }

    pub fn send(&self, fd: i32, buf: &[u8], flags: i32) -> Result<usize, Errno> {
        let mut inner = self.inner.lock().unwrap();
        {
            let entry = inner.files.get(&fd).ok_or(Errno::EBADF)?;
            let Endpoint::StreamSocket(_) = &entry.endpoint else {
                return Err(Errno::EBADF);
            };
            if entry.blocking && flags & MSG_DONTWAIT == 0 {
                if let Some(t) = entry.endpoint.target().get() {
                    self.selector.select(&[], &[t], None);
                }
            }
        }
        match &mut inner.files.get_mut(&fd).ok_or(Errno::EBADF)?.endpoint {
            Endpoint::StreamSocket(s) => s.send(buf, flags),
            _ => Err(Errno::EBADF),
        }
    }

    pub fn recv(&self, fd: i32, buf: &mut [u8], flags: i32) -> Result<usize, Errno> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.files.get(&fd).ok_or(Errno::EBADF)?;
        let Endpoint::StreamSocket(s) = &entry.endpoint else {
            return Err(Errno::EBADF);
        };
        if entry.blocking && flags & MSG_DONTWAIT == 0 {
            if let Some(t) = entry.endpoint.target().get() {
                self.selector.select(&[t], &[], None);
            }
        }
        s.stream().receive(buf, flags)
    }

    pub fn send_to(
        &self,
        fd: i32,
        buf: &[u8],
        flags: i32,
        addr: SocketAddr,
    ) -> Result<usize, Errno> {
        let mut inner = self.inner.lock().unwrap();
        {
            let entry = inner.files.get(&fd).ok_or(Errno::EBADF)?;
            let Endpoint::DatagramSocket(_) = &entry.endpoint else {
                return Err(Errno::EBADF);
            };
            if entry.blocking && flags & MSG_DONTWAIT == 0 {
                if let Some(t) = entry.endpoint.target().get() {
                    self.selector.select(&[], &[t], None);
                }
            }
        }
        match &mut inner.files.get_mut(&fd).ok_or(Errno::EBADF)?.endpoint {
            Endpoint::DatagramSocket(d) => d.send_to(buf.to_vec(), flags, addr),
            _ => Err(Errno::EBADF),
        }
    }

    /// Copies one packet into the caller's buffer set, returning the
    /// copied length and the packet's source address.
    pub fn recv_msg(
        &self,
        fd: i32,
        bufs: &mut [&mut [u8]],
        flags: i32,
    ) -> Result<(usize, SocketAddr), Errno> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.files.get(&fd).ok_or(Errno::EBADF)?;
        let Endpoint::DatagramSocket(d) = &entry.endpoint else {
            return Err(Errno::EBADF);
        };
        if entry.blocking && flags & MSG_DONTWAIT == 0 {
            if let Some(t) = entry.endpoint.target().get() {
                self.selector.select(&[t], &[], None);
            }
        }
        d.queue().receive(bufs)
    }

    /// Waits for readiness on the given descriptor sets. The signal
    /// pseudo-endpoint is always part of the wait; when it fires, its
    /// handler runs here and it does not count toward the result.
    pub fn pselect(
        &self,
        readfds: &mut FdSet,
        writefds: &mut FdSet,
        exceptfds: &mut FdSet,
        timeout: Option<Duration>,
    ) -> Result<usize, Errno> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let ready = {
            let mut read_targets: Vec<&Target> = Vec::new();
            let mut write_targets: Vec<&Target> = Vec::new();
            for (&fd, entry) in &inner.files {
                let Some(t) = entry.endpoint.target().get() else { continue };
                if readfds.contains(fd) {
                    read_targets.push(t);
                }
                if writefds.contains(fd) {
                    write_targets.push(t);
                }
            }
            if let Some(sig) = &inner.signal {
                if let Some(t) = sig.target().get() {
                    read_targets.push(t);
                }
            }
            self.selector.select(&read_targets, &write_targets, timeout)
        };

        let mut out_read = FdSet::new();
        let mut out_write = FdSet::new();
        let mut count = 0;
        for id in ready {
            if id == SIGNAL_ID {
                if let Some(sig) = inner.signal.as_mut() {
                    if sig.target().has_read_data() {
                        sig.handle();
                    }
                }
                continue;
            }
            let Some(entry) = inner.files.get(&id) else { continue };
            if readfds.contains(id) && entry.endpoint.target().has_read_data() {
                out_read.set(id);
                count += 1;
            }
            if writefds.contains(id) && entry.endpoint.target().has_write_data() {
                out_write.set(id);
                count += 1;
            }
        }

        *readfds = out_read;
        *writefds = out_write;
        exceptfds.clear();
        Ok(count)
    }

    pub fn select(
        &self,
        readfds: &mut FdSet,
        writefds: &mut FdSet,
        exceptfds: &mut FdSet,
        timeout: Option<Duration>,
    ) -> Result<usize, Errno> {
        self.pselect(readfds, writefds, exceptfds, timeout)
    }

    /// Wraps `pselect`; used infrequently, so the event translation does
    /// not try to be exact beyond the bits below.
    pub fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> Result<usize, Errno> {
        let mut readfds = FdSet::new();
        let mut writefds = FdSet::new();
        let mut exceptfds = FdSet::new();
        for f in fds.iter() {
            if f.events & (POLLIN | POLLPRI) != 0 {
                readfds.set(f.fd);
            }
            if f.events & POLLOUT != 0 {
                writefds.set(f.fd);
            }
            if f.events & (POLLERR | POLLHUP | POLLNVAL) != 0 {
                exceptfds.set(f.fd);
            }
        }

        let timeout = if timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64))
        };
        let count = self.pselect(&mut readfds, &mut writefds, &mut exceptfds, timeout)?;

        for f in fds.iter_mut() {
            f.revents = 0;
            if readfds.contains(f.fd) {
                f.revents |= POLLIN | POLLPRI;
            }
            if writefds.contains(f.fd) {
                f.revents |= POLLOUT;
            }
            if exceptfds.contains(f.fd) {
                f.revents |= POLLERR | POLLHUP | POLLNVAL;
            }
        }
        Ok(count)
    }

    pub fn fcntl(&self, fd: i32, cmd: FcntlCmd) -> Result<(), Errno> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.files.get_mut(&fd).ok_or(Errno::EBADF)?;
        match cmd {
            FcntlCmd::SetFl(arg) => {
                let rest = arg & !O_NONBLOCK;
                if rest != 0 {
                    warn!("fcntl(F_SETFL): ignoring unsupported flags {rest:#o}");
                }
                entry.blocking = arg & O_NONBLOCK == 0;
                Ok(())
            }
            // There is no exec to survive, so close-on-exec is a no-op.
            FcntlCmd::SetFd(arg) if arg & FD_CLOEXEC != 0 => Ok(()),
            _ => {
                warn!("fcntl: unsupported cmd/arg");
                Err(Errno::EINVAL)
            }
        }
    }

    /// `SO_ERROR` lets a non-blocking connect's completion be polled; no
    /// other option is implemented.
    pub fn getsockopt(&self, fd: i32, level: i32, optname: i32) -> Result<i32, Errno> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.files.get(&fd).ok_or(Errno::EBADF)?;
        let Endpoint::StreamSocket(s) = &entry.endpoint else {
            return Err(Errno::EBADF);
        };
        if level == SOL_SOCKET && optname == SO_ERROR {
            return Ok(s.stream().conn_errno().map(Errno::code).unwrap_or(0));
        }
        warn!("getsockopt: unsupported optname/level");
        Err(Errno::EINVAL)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::endpoint::{FileIo, TargetCell};
    use crate::host::{
        ConnectDone, TcpRecvDone, TcpTransport, TransportError, UdpRecvDone,
        UdpTransport,
    };
    use crate::moshlog::init_test_log;
    use crate::stream::StreamCore;

    /// Runs posted tasks on the calling thread.
    pub(crate) struct InlineMain;

    impl MainThread for InlineMain {
        fn post(&self, task: Box<dyn FnOnce() + Send>) {
            task();
        }
    }

    pub(crate) struct NullReader {
        target: TargetCell,
    }

    impl NullReader {
        pub(crate) fn boxed() -> Box<dyn Reader> {
            Box::new(NullReader { target: TargetCell::new() })
        }
    }

    impl FileIo for NullReader {
        fn target(&self) -> &TargetCell {
            &self.target
        }
    }

    impl Reader for NullReader {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Errno> {
            Err(Errno::EWOULDBLOCK)
        }
    }

    pub(crate) struct NullWriter {
        target: TargetCell,
    }

    impl NullWriter {
        pub(crate) fn boxed() -> Box<dyn Writer> {
            Box::new(NullWriter { target: TargetCell::new() })
        }
    }

    impl FileIo for NullWriter {
        fn target(&self) -> &TargetCell {
            &self.target
        }
    }

    impl Writer for NullWriter {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Errno> {
            Ok(buf.len())
        }
    }

    /// Loopback-free scripted transports: sends succeed, receives stay
    /// pending forever, and connect completions are parked on a shared
    /// list for the test to fire (completions never arrive from inside
    /// the scheduling call, matching the transport contract).
    #[derive(Default)]
    pub(crate) struct ScriptedNet {
        pub(crate) connects: Arc<Mutex<Vec<ConnectDone>>>,
    }

    struct ScriptedUdp;

    impl UdpTransport for ScriptedUdp {
        fn bind(&mut self, _addr: SocketAddr) -> Result<(), TransportError> {
            Ok(())
        }
        fn send_to(
            &mut self,
            buf: &[u8],
            _addr: SocketAddr,
        ) -> Result<usize, TransportError> {
            Ok(buf.len())
        }
        fn recv_from(&mut self, _buf_size: usize, _done: UdpRecvDone) {}
    }

    struct ScriptedTcp {
        connects: Arc<Mutex<Vec<ConnectDone>>>,
    }

    impl TcpTransport for ScriptedTcp {
        fn connect(&mut self, _addr: SocketAddr, done: ConnectDone) {
            self.connects.lock().unwrap().push(done);
        }
        fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
            Ok(buf.len())
        }
        fn recv(&mut self, _buf_size: usize, _done: TcpRecvDone) {}
    }

    impl NetFactory for ScriptedNet {
        fn udp(&self) -> Box<dyn UdpTransport> {
            Box::new(ScriptedUdp)
        }
        fn tcp(&self) -> Box<dyn TcpTransport> {
            Box::new(ScriptedTcp { connects: self.connects.clone() })
        }
    }

    pub(crate) fn test_posix() -> Posix {
        test_posix_with(ScriptedNet::default())
    }

    fn test_posix_tcp() -> (Posix, Arc<Mutex<Vec<ConnectDone>>>) {
        let net = ScriptedNet::default();
        let connects = net.connects.clone();
        (test_posix_with(net), connects)
    }

    pub(crate) fn test_posix_with(net: impl NetFactory + 'static) -> Posix {
        Posix::new(
            Box::new(net),
            Arc::new(InlineMain),
            NullReader::boxed(),
            NullWriter::boxed(),
            NullWriter::boxed(),
            None,
        )
    }

    struct TestLocalStream {
        core: Arc<StreamCore>,
        sent: Arc<Mutex<Vec<u8>>>,
        connected: bool,
    }

    impl FileIo for TestLocalStream {
        fn target(&self) -> &TargetCell {
            self.core.target()
        }
    }

    impl LocalStreamSocket for TestLocalStream {
        fn stream(&self) -> &Arc<StreamCore> {
            &self.core
        }
        fn send(&mut self, buf: &[u8], _flags: i32) -> Result<usize, Errno> {
            if !self.connected {
                return Err(Errno::ENOTCONN);
            }
            self.sent.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn connect(&mut self, path: &str) -> Result<(), Errno> {
            if path != "agent" {
                return Err(Errno::EACCES);
            }
            self.connected = true;
            self.core.target().update_write(true);
            Ok(())
        }
    }

    #[test]
    fn descriptors_start_after_stdio() {
        init_test_log();
        let posix = test_posix();
        assert_eq!(posix.socket(AF_INET, SOCK_DGRAM, 0).unwrap(), 3);
        assert_eq!(posix.socket(AF_INET6, SOCK_DGRAM, IPPROTO_UDP).unwrap(), 4);
    }

    #[test]
    fn lowest_free_descriptor_is_reused() {
        init_test_log();
        let posix = test_posix();
        let a = posix.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
        let b = posix.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
        let c = posix.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
        assert_eq!((a, b, c), (3, 4, 5));

        posix.close(b).unwrap();
        assert_eq!(posix.socket(AF_INET, SOCK_DGRAM, 0).unwrap(), b);
        posix.close(a).unwrap();
        posix.close(c).unwrap();
        assert_eq!(posix.socket(AF_INET, SOCK_STREAM, 0).unwrap(), a);
    }

    #[test]
    fn unknown_socket_kinds_are_invalid() {
        init_test_log();
        let posix = test_posix();
        assert_eq!(posix.socket(99, SOCK_DGRAM, 0), Err(Errno::EINVAL));
        assert_eq!(posix.socket(AF_INET, SOCK_DGRAM, IPPROTO_TCP), Err(Errno::EINVAL));
        assert_eq!(posix.socket(AF_INET, 7, 0), Err(Errno::EINVAL));
        // No local stream factory registered.
        assert_eq!(posix.socket(AF_UNIX, SOCK_STREAM, 0), Err(Errno::EINVAL));
    }

    #[test]
    fn open_requires_registered_path() {
        init_test_log();
        let posix = test_posix();
        assert_eq!(posix.open("/etc/passwd"), Err(Errno::EACCES));

        posix.register_file(
            "/dev/zero",
            Box::new(|| {
                struct Zero {
                    target: TargetCell,
                }
                impl FileIo for Zero {
                    fn target(&self) -> &TargetCell {
                        &self.target
                    }
                }
                impl Reader for Zero {
                    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
                        buf.fill(0);
                        Ok(buf.len())
                    }
                }
                Endpoint::RandomReader(Box::new(Zero { target: TargetCell::new() }))
            }),
        );
        let fd = posix.open("/dev/zero").unwrap();
        assert_eq!(fd, 3);
        let mut buf = [9u8; 4];
        // Readers are read-ready only via their target; bypass blocking.
        posix.fcntl(fd, FcntlCmd::SetFl(O_NONBLOCK)).unwrap();
        assert_eq!(posix.read(fd, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn close_unknown_descriptor_is_ebadf() {
        init_test_log();
        let posix = test_posix();
        assert_eq!(posix.close(9), Err(Errno::EBADF));
    }

    #[test]
    fn dup_only_datagram() {
        init_test_log();
        let posix = test_posix();
        let udp = posix.socket(AF_INET6, SOCK_DGRAM, 0).unwrap();
        let tcp = posix.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        assert_eq!(posix.dup(tcp), Err(Errno::EBADF));
        assert_eq!(posix.dup(0), Err(Errno::EBADF));
        let dup = posix.dup(udp).unwrap();
        assert_ne!(dup, udp);
    }

    #[test]
    fn nonblocking_recv_would_block() {
        init_test_log();
        let posix = test_posix();
        let fd = posix.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        let mut buf = [0u8; 4];
        // MSG_DONTWAIT skips the park even on a blocking descriptor.
        assert_eq!(posix.recv(fd, &mut buf, MSG_DONTWAIT), Err(Errno::EWOULDBLOCK));
        posix.fcntl(fd, FcntlCmd::SetFl(O_NONBLOCK)).unwrap();
        assert_eq!(posix.recv(fd, &mut buf, 0), Err(Errno::EWOULDBLOCK));
    }

    #[test]
    fn fcntl_rejects_unknown_cmds() {
        init_test_log();
        let posix = test_posix();
        let fd = posix.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
        assert_eq!(posix.fcntl(fd, FcntlCmd::SetFd(FD_CLOEXEC)), Ok(()));
        assert_eq!(posix.fcntl(fd, FcntlCmd::SetFd(0)), Err(Errno::EINVAL));
        // Extra F_SETFL bits are ignored, O_NONBLOCK still honored.
        assert_eq!(posix.fcntl(fd, FcntlCmd::SetFl(O_NONBLOCK | 0o100)), Ok(()));
    }

    #[test]
    fn so_error_reports_connect_failure() {
        init_test_log();
        let (posix, connects) = test_posix_tcp();
        let fd = posix.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        let addr: SocketAddr = "192.0.2.7:22".parse().unwrap();
        assert_eq!(posix.connect(fd, &SockAddr::Inet(addr)), Err(Errno::EINPROGRESS));
        assert_eq!(posix.getsockopt(fd, SOL_SOCKET, SO_ERROR).unwrap(), 0);

        let done = connects.lock().unwrap().pop().unwrap();
        done(Err(TransportError::Failed));
        assert_eq!(posix.getsockopt(fd, SOL_SOCKET, SO_ERROR).unwrap(), Errno::EIO.code());
        assert_eq!(posix.getsockopt(fd, SOL_SOCKET, 99), Err(Errno::EINVAL));
    }

    #[test]
    fn successful_connect_raises_write_ready() {
        init_test_log();
        let (posix, connects) = test_posix_tcp();
        let fd = posix.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        let addr: SocketAddr = "192.0.2.7:22".parse().unwrap();
        assert_eq!(posix.connect(fd, &SockAddr::Inet(addr)), Err(Errno::EINPROGRESS));

        let done = connects.lock().unwrap().pop().unwrap();
        done(Ok(()));

        let mut readfds = FdSet::new();
        let mut writefds = FdSet::new();
        let mut exceptfds = FdSet::new();
        writefds.set(fd);
        let n = posix
            .pselect(&mut readfds, &mut writefds, &mut exceptfds, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(n, 1);
        assert!(writefds.contains(fd));
    }

    #[test]
    fn local_stream_connects_by_name() {
        init_test_log();
        let posix = test_posix();
        let injector: Arc<Mutex<Option<Arc<StreamCore>>>> = Arc::new(Mutex::new(None));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let injector2 = injector.clone();
        let sent2 = sent.clone();
        posix.register_local_stream(Box::new(move || {
            let core = StreamCore::new();
            *injector2.lock().unwrap() = Some(core.clone());
            Box::new(TestLocalStream {
                core,
                sent: sent2.clone(),
                connected: false,
            })
        }));

        let fd = posix.socket(AF_UNIX, SOCK_STREAM, 0).unwrap();
        assert_eq!(
            posix.connect(fd, &SockAddr::Local("nonsense".into())),
            Err(Errno::EACCES)
        );
        posix.connect(fd, &SockAddr::Local("agent".into())).unwrap();

        posix.write(fd, b"to-agent").unwrap();
        assert_eq!(&*sent.lock().unwrap(), b"to-agent");

        let core = injector.lock().unwrap().clone().unwrap();
        core.add_data(b"reply");
        let mut buf = [0u8; 16];
        let n = posix.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[test]
    fn poll_maps_event_bits() {
        init_test_log();
        let posix = test_posix();
        let udp = posix.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
        let mut fds = [
            PollFd { fd: udp, events: POLLIN | POLLOUT, revents: 0 },
            PollFd { fd: 0, events: POLLIN, revents: 0 },
        ];
        // Datagram sockets are write-ready from the start.
        let n = posix.poll(&mut fds, 10).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fds[0].revents, POLLOUT);
        assert_eq!(fds[1].revents, 0);
    }

    #[test]
    fn recv_msg_returns_packet_and_source() {
        init_test_log();
        let posix = test_posix();
        let fd = posix.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
        let queue = {
            let inner = posix.inner.lock().unwrap();
            match &inner.files.get(&fd).unwrap().endpoint {
                Endpoint::DatagramSocket(d) => d.queue().clone(),
                _ => unreachable!(),
            }
        };
        let source: SocketAddr = "198.51.100.4:60001".parse().unwrap();
        queue.add_packet(crate::datagram::Packet {
            source,
            payload: b"dgram".to_vec(),
        });

        let mut buf = [0u8; 16];
        let (n, from) = posix.recv_msg(fd, &mut [&mut buf], 0).unwrap();
        assert_eq!(&buf[..n], b"dgram");
        assert_eq!(from, source);
        assert_eq!(
            posix.recv_msg(fd, &mut [&mut buf], MSG_DONTWAIT),
            Err(Errno::EWOULDBLOCK)
        );
    }
}
