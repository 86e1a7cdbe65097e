//! Listeners, connections and the poll reactor that drives them.
//!
//! Everything runs on one thread. Each connection is serviced only when `poll` says its socket is
//! ready; partial reads and writes leave their progress in the `Connection` and resume on the
//! next readiness event.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{self, MsgFlags};
use tracing::{debug, error, info, warn};

use crate::cache::LruCache;
use crate::config::{Config, ServerConfig, Settings};
use crate::http::{LogEncoded, MimeMap, Status};
use crate::request::{ParseState, Request, Resolution};
use crate::response::dispatch;

const POLL_WAIT_MS: libc::c_int = 200;
const RECV_CHUNK: usize = 1 << 15;
const ACCEPT_BATCH: usize = 64;
/// How often an interrupted socket call is retried before the connection is given up.
const IO_RETRIES: usize = 5;

/// One server block together with its location cache.
#[derive(Debug)]
pub struct VirtualHost {
    pub config: ServerConfig,
    pub cache: LruCache<Resolution>,
}

impl VirtualHost {
    pub fn new(config: ServerConfig, cache_capacity: usize) -> Self {
        Self {
            config,
            cache: LruCache::new(cache_capacity),
        }
    }
}

/// A listening socket and the virtual hosts sharing its address.
#[derive(Debug)]
struct Listener {
    socket: TcpListener,
    addr: SocketAddr,
    hosts: Vec<VirtualHost>,
}

impl Listener {
    fn bind(addr: SocketAddr, host: VirtualHost) -> Result<Self> {
        // Sets `SO_REUSEADDR` implicitly.
        let socket = TcpListener::bind(addr)
            .with_context(|| format!("failed to create listening socket for {}", addr))?;
        socket
            .set_nonblocking(true)
            .with_context(|| format!("failed to make listener for {} non-blocking", addr))?;
        let local = socket.local_addr().unwrap_or(addr);
        info!(target: "reactor", "listening on: http://{}/", local);
        Ok(Self {
            socket,
            addr: local,
            hosts: vec![host],
        })
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

impl ServerStats {
    fn log(&self) -> Result<()> {
        let rusage = getrusage().context("failed to get resource usage")?;
        info!(
            target: "reactor",
            "CPU time used: {}.{:02} user, {}.{:02} system",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
        );
        info!(target: "reactor", "Requests: {}", self.num_requests);
        info!(target: "reactor", "Bytes: {} in, {} out", self.total_in, self.total_out);
        Ok(())
    }
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Receive,
    Send,
    Done,
}

#[derive(Debug)]
struct Connection {
    socket: TcpStream,
    client: IpAddr,
    /// Index of the listener that accepted this connection.
    listener: usize,
    state: ConnectionState,
    buffer: Vec<u8>,
    request: Request,
    /// Serialized response, present once the request has been dispatched.
    reply: Option<Vec<u8>>,
    sent: usize,
    status: Status,
    keep_alive: bool,
}

impl Connection {
    fn new(socket: TcpStream, client: IpAddr, listener: usize) -> Self {
        Self {
            socket,
            client,
            listener,
            state: ConnectionState::Receive,
            buffer: Vec::new(),
            request: Request::new(),
            reply: None,
            sent: 0,
            status: Status::OK,
            keep_alive: false,
        }
    }

    /// Prepare a kept-alive connection for its next request. Bytes already buffered stay.
    fn recycle(&mut self) {
        self.state = ConnectionState::Receive;
        self.request = Request::new();
        self.reply = None;
        self.sent = 0;
        self.status = Status::OK;
        self.keep_alive = false;
    }

    fn give_up(&mut self) {
        self.keep_alive = false;
        self.state = ConnectionState::Done;
    }

    fn advance(&mut self, hosts: &mut [VirtualHost], settings: &Settings, now: Instant) {
        if self.request.advance(&mut self.buffer, hosts, settings, now) == ParseState::Ready {
            // dispatch waits for the socket to become writable
            self.state = ConnectionState::Send;
        }
    }

    /// Receiving request.
    fn poll_receive(
        &mut self,
        hosts: &mut [VirtualHost],
        settings: &Settings,
        stats: &mut ServerStats,
        now: Instant,
    ) {
        let mut buf = [0; RECV_CHUNK];
        let mut attempts = 0;
        let received = loop {
            match socket::recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) => {
                    // peer closed
                    self.give_up();
                    return;
                }
                Ok(received) => break received,
                Err(nix::Error::Sys(Errno::EAGAIN)) => {
                    // would block
                    return;
                }
                Err(nix::Error::Sys(Errno::EINTR)) if attempts < IO_RETRIES => attempts += 1,
                Err(e) => {
                    debug!(target: "reactor", "recv from {} failed: {}", self.client, e);
                    self.give_up();
                    return;
                }
            }
        };
        stats.total_in += received as u64;
        self.buffer.extend_from_slice(&buf[..received]);
        self.advance(hosts, settings, now);
    }

    /// Sending reply. The request is dispatched on the first call.
    fn poll_send(
        &mut self,
        hosts: &mut [VirtualHost],
        settings: &Settings,
        mime_map: &MimeMap,
        stats: &mut ServerStats,
    ) {
        if self.reply.is_none() {
            let response = dispatch(&mut self.request, hosts, settings, mime_map);
            self.keep_alive = self.request.keep_alive && !response.close;
            self.status = response.status;
            self.reply = Some(response.serialize(self.keep_alive, settings, SystemTime::now()));
            self.sent = 0;
        }
        let reply = match &self.reply {
            Some(reply) => reply,
            None => return,
        };

        let mut attempts = 0;
        while self.sent < reply.len() {
            match socket::send(
                self.socket.as_raw_fd(),
                &reply[self.sent..],
                MsgFlags::empty(),
            ) {
                Ok(sent) if sent > 0 => {
                    self.sent += sent;
                    stats.total_out += sent as u64;
                }
                Err(nix::Error::Sys(Errno::EAGAIN)) => {
                    // would block
                    return;
                }
                Err(nix::Error::Sys(Errno::EINTR)) if attempts < IO_RETRIES => attempts += 1,
                _ => {
                    // closure or other error
                    self.give_up();
                    return;
                }
            }
        }
        self.state = ConnectionState::Done;
    }

    fn log(&self) {
        let method = self.request.method.map_or("-", |method| method.as_str());
        info!(
            target: "access",
            "{} \"{} {}\" {} {} \"{}\"",
            self.client,
            method,
            LogEncoded(&self.request.target),
            self.status.code(),
            self.sent,
            LogEncoded(&self.request.referer),
        );
    }
}

/// The event loop.
pub struct Reactor {
    settings: Settings,
    mime_map: MimeMap,
    listeners: Vec<Listener>,
    connections: HashMap<RawFd, Connection>,
    /// Listener descriptors first, then one entry per connection.
    poll_fds: Vec<PollFd>,
    /// Descriptor of each `poll_fds` entry.
    descriptors: Vec<RawFd>,
    /// Connection descriptor to its index in `poll_fds`.
    slots: HashMap<RawFd, usize>,
    deadlines: BTreeMap<RawFd, Instant>,
    expiry: BTreeSet<(Instant, RawFd)>,
    healthy: bool,
    stats: ServerStats,
}

impl Reactor {
    /// Bind one listener per distinct address. Servers sharing an address become virtual hosts.
    pub fn new(config: Config, mime_map: MimeMap) -> Result<Self> {
        let settings = config.settings;
        let mut listeners: Vec<Listener> = Vec::new();
        for server in config.servers {
            let addr = server.socket_addr();
            let host = VirtualHost::new(server, settings.cache_capacity);
            match listeners
                .iter_mut()
                .find(|listener| listener.addr == addr && addr.port() != 0)
            {
                Some(listener) => listener.hosts.push(host),
                None => listeners.push(Listener::bind(addr, host)?),
            }
        }
        let poll_fds = listeners
            .iter()
            .map(|listener| PollFd::new(listener.socket.as_raw_fd(), PollFlags::POLLIN))
            .collect();
        let descriptors = listeners
            .iter()
            .map(|listener| listener.socket.as_raw_fd())
            .collect();
        Ok(Self {
            settings,
            mime_map,
            listeners,
            connections: HashMap::new(),
            poll_fds,
            descriptors,
            slots: HashMap::new(),
            deadlines: BTreeMap::new(),
            expiry: BTreeSet::new(),
            healthy: true,
            stats: ServerStats::default(),
        })
    }

    /// Addresses actually bound, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|listener| listener.addr).collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Loop until `running` is cleared or the reactor becomes unhealthy.
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::Relaxed) {
            self.tick()?;
        }
        Ok(())
    }

    /// One iteration: expire idle connections, wait for readiness, service ready descriptors.
    pub fn tick(&mut self) -> Result<()> {
        self.expire(Instant::now());

        match poll(&mut self.poll_fds, POLL_WAIT_MS) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(nix::Error::Sys(Errno::EINTR)) => {
                // interrupted by signal
                return Ok(());
            }
            Err(nix::Error::Sys(Errno::EBADF)) => {
                self.sweep();
                return Ok(());
            }
            Err(e) => {
                self.healthy = false;
                error!(target: "reactor", "poll() failed: {}", e);
                return Err(e).context("poll() failed");
            }
        }

        let now = Instant::now();
        let ready: Vec<(usize, RawFd, PollFlags)> = self
            .poll_fds
            .iter()
            .zip(&self.descriptors)
            .enumerate()
            .filter_map(|(slot, (pollfd, &fd))| {
                pollfd
                    .revents()
                    .filter(|revents| !revents.is_empty())
                    .map(|revents| (slot, fd, revents))
            })
            .collect();
        for (slot, fd, revents) in ready {
            if slot < self.listeners.len() {
                self.accept(slot, now);
            } else {
                self.service(fd, revents, now);
            }
        }
        Ok(())
    }

    /// Close every connection and report usage.
    pub fn shutdown(&mut self) -> Result<()> {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.remove_connection(fd, "shutting down");
        }
        self.stats.log()
    }

    fn accept(&mut self, index: usize, now: Instant) {
        for _ in 0..ACCEPT_BATCH {
            let (socket, addr) = match self.listeners[index].socket.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    // Failed to accept, but try to keep serving existing connections.
                    warn!(target: "reactor", "accept() failed: {}", e);
                    return;
                }
            };
            if let Err(e) = socket.set_nonblocking(true) {
                warn!(target: "reactor", "set_nonblocking failed for {}: {}", addr, e);
                continue;
            }
            debug!(target: "reactor", "accepted {} on {}", addr, self.listeners[index].addr);
            self.add_connection(Connection::new(socket, addr.ip(), index), now);
        }
    }

    fn add_connection(&mut self, conn: Connection, now: Instant) {
        let fd = conn.socket.as_raw_fd();
        self.slots.insert(fd, self.poll_fds.len());
        self.poll_fds.push(PollFd::new(fd, PollFlags::POLLIN));
        self.descriptors.push(fd);
        self.connections.insert(fd, conn);
        self.touch(fd, now);
    }

    /// Drop a connection from every index and close its socket.
    fn remove_connection(&mut self, fd: RawFd, reason: &str) {
        if let Some(slot) = self.slots.remove(&fd) {
            self.poll_fds.swap_remove(slot);
            self.descriptors.swap_remove(slot);
            if let Some(&moved) = self.descriptors.get(slot) {
                self.slots.insert(moved, slot);
            }
        }
        if let Some(deadline) = self.deadlines.remove(&fd) {
            self.expiry.remove(&(deadline, fd));
        }
        if let Some(conn) = self.connections.remove(&fd) {
            debug!(target: "reactor", "closing connection from {}: {}", conn.client, reason);
        }
    }

    fn touch(&mut self, fd: RawFd, now: Instant) {
        let deadline = now + self.settings.client_timeout();
        if let Some(previous) = self.deadlines.insert(fd, deadline) {
            self.expiry.remove(&(previous, fd));
        }
        self.expiry.insert((deadline, fd));
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(deadline, fd)) = self.expiry.iter().next() {
            if deadline > now {
                break;
            }
            self.remove_connection(fd, "idle timeout");
        }
    }

    /// Remove connections whose descriptor is no longer valid.
    fn sweep(&mut self) {
        let stale: Vec<RawFd> = self.descriptors[self.listeners.len()..]
            .iter()
            .copied()
            .filter(|&fd| matches!(fcntl(fd, FcntlArg::F_GETFD), Err(nix::Error::Sys(Errno::EBADF))))
            .collect();
        warn!(target: "reactor", "poll() reported bad descriptors, dropping {}", stale.len());
        for fd in stale {
            self.remove_connection(fd, "bad descriptor");
        }
    }

    fn service(&mut self, fd: RawFd, revents: PollFlags, now: Instant) {
        if revents.contains(PollFlags::POLLNVAL) {
            self.remove_connection(fd, "invalid descriptor");
            return;
        }
        let conn = match self.connections.get_mut(&fd) {
            Some(conn) => conn,
            None => return,
        };
        let hosts = &mut self.listeners[conn.listener].hosts;
        let wakeup = PollFlags::POLLHUP | PollFlags::POLLERR;
        match conn.state {
            ConnectionState::Receive => {
                if revents.intersects(PollFlags::POLLIN | wakeup) {
                    conn.poll_receive(hosts, &self.settings, &mut self.stats, now);
                }
            }
            ConnectionState::Send => {
                if revents.intersects(PollFlags::POLLOUT | wakeup) {
                    conn.poll_send(hosts, &self.settings, &self.mime_map, &mut self.stats);
                }
            }
            ConnectionState::Done => {}
        }
        self.settle(fd, now);
    }

    /// Finish, recycle or re-arm a connection after it was serviced.
    fn settle(&mut self, fd: RawFd, now: Instant) {
        let conn = match self.connections.get_mut(&fd) {
            Some(conn) => conn,
            None => return,
        };
        if conn.state == ConnectionState::Done {
            if conn.reply.is_none() {
                self.remove_connection(fd, "peer closed");
                return;
            }
            conn.log();
            self.stats.num_requests += 1;
            if !conn.keep_alive {
                self.remove_connection(fd, "response complete");
                return;
            }
            conn.recycle();
            if !conn.buffer.is_empty() {
                // the next request arrived with the previous one
                let hosts = &mut self.listeners[conn.listener].hosts;
                conn.advance(hosts, &self.settings, now);
            }
        }
        let events = match conn.state {
            ConnectionState::Send => PollFlags::POLLOUT,
            _ => PollFlags::POLLIN,
        };
        if let Some(&slot) = self.slots.get(&fd) {
            self.poll_fds[slot] = PollFd::new(fd, events);
        }
        self.touch(fd, now);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::write;
    use std::io::{Read, Write};
    use std::time::Duration;

    use tempfile::{tempdir, TempDir};

    fn reactor(settings: &str) -> (TempDir, Reactor) {
        let root = tempdir().unwrap();
        write(root.path().join("index.html"), "hello").unwrap();
        let yaml = format!(
            "settings: {{{}}}\nservers:\n  - port: 0\n    bind: 127.0.0.1\n    root: {}\n",
            settings,
            root.path().display()
        );
        let config = Config::from_yaml_str(&yaml).unwrap();
        (root, Reactor::new(config, MimeMap::default()).unwrap())
    }

    fn connect(reactor: &Reactor) -> TcpStream {
        let stream = TcpStream::connect(reactor.local_addrs()[0]).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    fn spin(reactor: &mut Reactor, ticks: usize) {
        for _ in 0..ticks {
            reactor.tick().unwrap();
        }
    }

    fn assert_indices_consistent(reactor: &Reactor) {
        let listeners = reactor.listeners.len();
        assert_eq!(reactor.poll_fds.len(), reactor.descriptors.len());
        assert_eq!(reactor.descriptors.len(), listeners + reactor.connections.len());
        assert_eq!(reactor.slots.len(), reactor.connections.len());
        for (&fd, &slot) in &reactor.slots {
            assert_eq!(reactor.descriptors[slot], fd);
            assert!(reactor.connections.contains_key(&fd));
        }
        assert_eq!(reactor.deadlines.len(), reactor.expiry.len());
    }

    #[test]
    fn serves_two_requests_on_one_connection() {
        let (_root, mut reactor) = reactor("");
        let mut stream = connect(&reactor);
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\n\r\nGET /index.html HTTP/1.1\r\n\r\n")
            .unwrap();
        spin(&mut reactor, 8);
        let mut buf = vec![0; 4096];
        let mut received = Vec::new();
        while received.windows(5).filter(|w| w == b"hello").count() < 2 {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8(received).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert_eq!(reactor.connection_count(), 1);
        assert_eq!(reactor.stats.num_requests, 2);
        assert_indices_consistent(&reactor);
    }

    #[test]
    fn closed_peer_is_removed() {
        let (_root, mut reactor) = reactor("");
        let streams: Vec<TcpStream> = (0..3).map(|_| connect(&reactor)).collect();
        spin(&mut reactor, 2);
        assert_eq!(reactor.connection_count(), 3);
        let mut streams = streams.into_iter();
        let first = streams.next().unwrap();
        drop(first);
        spin(&mut reactor, 2);
        assert_eq!(reactor.connection_count(), 2);
        assert_indices_consistent(&reactor);
        drop(streams);
    }

    #[test]
    fn idle_connection_expires() {
        let (_root, mut reactor) = reactor("client_timeout_secs: 1");
        let mut idle = connect(&reactor);
        spin(&mut reactor, 1);
        assert_eq!(reactor.connection_count(), 1);
        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(1300) {
            reactor.tick().unwrap();
        }
        assert_eq!(reactor.connection_count(), 0);
        assert_indices_consistent(&reactor);
        let mut buf = [0; 16];
        assert_eq!(idle.read(&mut buf).unwrap(), 0);
    }

    /// A descriptor number that is never open.
    const STALE_FD: RawFd = RawFd::MAX - 1;

    fn register_stale(reactor: &mut Reactor) {
        reactor.slots.insert(STALE_FD, reactor.poll_fds.len());
        reactor.poll_fds.push(PollFd::new(STALE_FD, PollFlags::POLLIN));
        reactor.descriptors.push(STALE_FD);
        reactor.touch(STALE_FD, Instant::now());
    }

    fn assert_stale_gone(reactor: &Reactor) {
        assert!(!reactor.slots.contains_key(&STALE_FD));
        assert!(!reactor.descriptors.contains(&STALE_FD));
        assert!(!reactor.deadlines.contains_key(&STALE_FD));
    }

    fn assert_serves(reactor: &mut Reactor, stream: &mut TcpStream) {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        spin(reactor, 4);
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn invalid_descriptor_is_dropped() {
        let (_root, mut reactor) = reactor("");
        let _first = connect(&reactor);
        spin(&mut reactor, 1);
        register_stale(&mut reactor);
        // accepted while the stale entry is still registered, then moved into its slot
        let mut second = connect(&reactor);
        spin(&mut reactor, 1);
        assert_stale_gone(&reactor);
        assert_eq!(reactor.connection_count(), 2);
        assert_indices_consistent(&reactor);
        assert_serves(&mut reactor, &mut second);
    }

    #[test]
    fn sweep_drops_bad_descriptors() {
        let (_root, mut reactor) = reactor("");
        let _first = connect(&reactor);
        spin(&mut reactor, 1);
        register_stale(&mut reactor);
        let mut second = connect(&reactor);
        reactor.accept(0, Instant::now());
        assert_eq!(reactor.connection_count(), 2);
        reactor.sweep();
        assert_stale_gone(&reactor);
        assert_eq!(reactor.connection_count(), 2);
        assert_indices_consistent(&reactor);
        assert_serves(&mut reactor, &mut second);
    }

    #[test]
    fn peer_gone_while_sending() {
        let (root, mut reactor) = reactor("");
        write(root.path().join("large.bin"), vec![b'x'; 4 << 20]).unwrap();
        let mut stream = connect(&reactor);
        stream
            .write_all(b"GET /large.bin HTTP/1.1\r\n\r\n")
            .unwrap();
        spin(&mut reactor, 2);
        drop(stream);
        let started = Instant::now();
        while reactor.connection_count() > 0 && started.elapsed() < Duration::from_secs(5) {
            reactor.tick().unwrap();
        }
        assert_eq!(reactor.connection_count(), 0);
        assert!(reactor.is_healthy());
        assert_indices_consistent(&reactor);
    }

    #[test]
    fn error_response_closes_connection() {
        let (_root, mut reactor) = reactor("");
        let mut stream = connect(&reactor);
        stream.write_all(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap();
        spin(&mut reactor, 6);
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(reactor.connection_count(), 0);
    }
}
