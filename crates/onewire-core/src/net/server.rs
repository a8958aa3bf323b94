//! TCP host that exposes one local adapter to remote [`NetAdapter`] clients.
//!
//! Every accepted connection runs the version/challenge handshake and then
//! serves commands against its own adapter session. In multithreaded mode
//! each connection gets a thread; otherwise connections are served one at a
//! time on the accept thread with an idle read timeout.
//!
//! [`NetAdapter`]: super::NetAdapter

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, instrument, warn};

use super::constants::{CHALLENGE_LEN, DEFAULT_SECRET, PROTOCOL_VERSION, RET_FAILURE, RET_SUCCESS};
use super::handlers::{HandleResult, HandlerContext, handle_request};
use super::wire::{WireRead, WireWrite, auth_response};
use crate::adapter::PortAdapter;
use crate::error::Result;
use crate::events::{BusEvent, BusObserver, TracingObserver};
use crate::sync::lock;

/// How often the accept loop and shutdown look at their flags.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Sent before closing a connection whose challenge answer was wrong.
const AUTH_FAILED_MESSAGE: &str = "Client Authentication Failed";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub secret: String,
    /// One thread per connection instead of serving them in turn.
    pub multithreaded: bool,
    /// Read timeout for client sockets in single-threaded mode.
    pub idle_timeout: Duration,
    /// How long `stop` waits for connection threads.
    pub shutdown_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            secret: DEFAULT_SECRET.to_string(),
            multithreaded: true,
            idle_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Outcome of the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Accepted,
    VersionRejected,
    AuthenticationFailed,
}

struct Connection {
    id: u64,
    peer: SocketAddr,
    /// Clone of the client socket, used to unblock the handler on stop.
    stream: TcpStream,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    options: ServerOptions,
    observer: Arc<dyn BusObserver>,
    stopping: AtomicBool,
    next_connection: AtomicU64,
    connections: Mutex<Vec<Connection>>,
}

impl Shared {
    fn emit(&self, event: BusEvent) {
        self.observer.on_event(&event);
    }

    /// Track a new client. Returns `false` once `stop` has begun, so a
    /// connection accepted after the registry was drained is not left open.
    fn register(&self, id: u64, peer: SocketAddr, stream: &TcpStream) -> io::Result<bool> {
        let stream = stream.try_clone()?;
        let mut connections = lock(&self.connections);
        if self.stopping.load(Ordering::Acquire) {
            return Ok(false);
        }
        connections.push(Connection {
            id,
            peer,
            stream,
            thread: None,
        });
        Ok(true)
    }

    fn unregister(&self, id: u64) {
        lock(&self.connections).retain(|c| c.id != id);
    }
}

/// Bound, not yet running proxy host.
pub struct ProxyServer {
    listener: TcpListener,
    adapter: Box<dyn PortAdapter>,
    shared: Arc<Shared>,
}

impl ProxyServer {
    /// Bind the listening socket. `adapter` is the template each connection
    /// derives its session from.
    pub fn bind(
        addr: impl ToSocketAddrs,
        adapter: Box<dyn PortAdapter>,
        options: ServerOptions,
    ) -> Result<Self> {
        Self::bind_with_observer(addr, adapter, options, Arc::new(TracingObserver))
    }

    pub fn bind_with_observer(
        addr: impl ToSocketAddrs,
        adapter: Box<dyn PortAdapter>,
        options: ServerOptions,
        observer: Arc<dyn BusObserver>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            adapter,
            shared: Arc::new(Shared {
                options,
                observer,
                stopping: AtomicBool::new(false),
                next_connection: AtomicU64::new(1),
                connections: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("owbridge-proxy".to_string())
            .spawn(move || self.run())?;
        Ok(ServerHandle {
            shared,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Accept and serve clients until a [`ServerHandle`] stops the server.
    #[instrument(skip_all)]
    pub fn run(self) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            adapter = self.adapter.adapter_name(),
            port = self.adapter.port_name(),
            multithreaded = self.shared.options.multithreaded,
            "Proxy server listening"
        );
        while !self.shared.stopping.load(Ordering::Acquire) {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if is_timeout_error(&e) => {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };
            if let Err(e) = self.accept(stream, peer) {
                warn!(peer = %peer, error = %e, "Could not start client session");
            }
        }
        self.shared.emit(BusEvent::ServerStopped);
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        if !self.shared.register(id, peer, &stream)? {
            debug!(peer = %peer, "Refusing client during shutdown");
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        }
        let session = match self.adapter.new_session() {
            Ok(session) => session,
            Err(e) => {
                self.shared.unregister(id);
                return Err(e);
            }
        };

        if !self.shared.options.multithreaded {
            stream.set_read_timeout(Some(self.shared.options.idle_timeout))?;
            serve_connection(&self.shared, stream, peer, session);
            self.shared.unregister(id);
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("owbridge-client-{id}"))
            .spawn(move || {
                serve_connection(&shared, stream, peer, session);
                shared.unregister(id);
            });
        match spawned {
            Ok(handle) => {
                let mut connections = lock(&self.shared.connections);
                match connections.iter_mut().find(|c| c.id == id) {
                    Some(connection) => connection.thread = Some(handle),
                    // Already finished and unregistered itself.
                    None => drop(handle),
                }
                Ok(())
            }
            Err(e) => {
                self.shared.unregister(id);
                Err(e.into())
            }
        }
    }
}

/// Control handle for a spawned [`ProxyServer`].
pub struct ServerHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of clients currently being served.
    pub fn active_connections(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    /// Block until the accept loop exits.
    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Proxy accept thread panicked");
        }
    }

    /// Stop accepting, disconnect every client and wait for their threads
    /// up to the configured grace period. Calling it again is a no-op.
    pub fn stop(&mut self) {
        let Some(accept_thread) = self.thread.take() else {
            return;
        };
        self.shared.stopping.store(true, Ordering::Release);

        let connections: Vec<Connection> = lock(&self.shared.connections).drain(..).collect();
        for connection in &connections {
            debug!(peer = %connection.peer, "Closing client connection");
            let _ = connection.stream.shutdown(Shutdown::Both);
        }

        if accept_thread.join().is_err() {
            warn!("Proxy accept thread panicked");
        }

        let deadline = Instant::now() + self.shared.options.shutdown_grace;
        for connection in connections {
            let Some(thread) = connection.thread else {
                continue;
            };
            while !thread.is_finished() && Instant::now() < deadline {
                thread::sleep(POLL_INTERVAL);
            }
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                warn!(peer = %connection.peer, "Client handler did not stop in time");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[instrument(skip_all, fields(peer = %peer, session = %adapter.session_id()))]
fn serve_connection(shared: &Shared, stream: TcpStream, peer: SocketAddr, mut adapter: Box<dyn PortAdapter>) {
    shared.emit(BusEvent::ClientConnected { peer });

    let streams = stream.try_clone().map(|write_half| {
        (BufReader::new(stream), BufWriter::new(write_half))
    });
    let (mut input, mut output) = match streams {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "Could not split client socket");
            shared.emit(BusEvent::ClientDisconnected { peer });
            return;
        }
    };

    match handshake(&mut input, &mut output, &shared.options.secret) {
        Ok(Handshake::Accepted) => {
            command_loop(shared, &mut input, &mut output, adapter.as_mut());
        }
        Ok(Handshake::VersionRejected) => {
            debug!("Client rejected protocol version");
        }
        Ok(Handshake::AuthenticationFailed) => {
            shared.emit(BusEvent::AuthenticationFailed { peer });
        }
        Err(e) => debug!(error = %e, "Handshake aborted"),
    }

    if let Err(e) = adapter.end_exclusive() {
        debug!(error = %e, "Releasing lease after disconnect failed");
    }
    let _ = input.get_ref().shutdown(Shutdown::Both);
    shared.emit(BusEvent::ClientDisconnected { peer });
}

fn command_loop<R: Read, W: Write>(
    shared: &Shared,
    input: &mut R,
    output: &mut W,
    adapter: &mut dyn PortAdapter,
) {
    while !shared.stopping.load(Ordering::Acquire) {
        let mut ctx = HandlerContext {
            input: &mut *input,
            output: &mut *output,
            adapter: &mut *adapter,
        };
        match handle_request(&mut ctx) {
            Ok(HandleResult::Continue) => {}
            Ok(HandleResult::Close) => {
                debug!("Client closed session");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Client hung up");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Client stream error");
                break;
            }
        }
    }
}

/// Server side of the version exchange and challenge/response.
fn handshake<R: Read, W: Write>(input: &mut R, output: &mut W, secret: &str) -> io::Result<Handshake> {
    output.write_i32_be(PROTOCOL_VERSION)?;
    output.flush()?;
    if input.read_u8()? != RET_SUCCESS {
        return Ok(Handshake::VersionRejected);
    }

    let challenge: [u8; CHALLENGE_LEN] = rand::random();
    output.write_all(&challenge)?;
    output.flush()?;

    let answer = input.read_i32_be()?;
    if answer != auth_response(secret, &challenge) {
        output.write_u8(RET_FAILURE)?;
        output.write_utf(AUTH_FAILED_MESSAGE)?;
        output.flush()?;
        return Ok(Handshake::AuthenticationFailed);
    }
    output.write_u8(RET_SUCCESS)?;
    output.flush()?;
    Ok(Handshake::Accepted)
}

pub(crate) fn is_timeout_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SimAdapter;
    use crate::address::Address;
    use crate::events::tests::RecordingObserver;
    use crate::sim::VirtualBus;

    fn spawn_server(options: ServerOptions, observer: Arc<dyn BusObserver>) -> ServerHandle {
        let bus = VirtualBus::with_devices(&[Address::with_crc(0x28, [1, 2, 3, 4, 5, 6])]);
        let adapter = Box::new(SimAdapter::new(bus));
        ProxyServer::bind_with_observer("127.0.0.1:0", adapter, options, observer)
            .unwrap()
            .spawn()
            .unwrap()
    }

    /// Client half of the handshake, answering with `secret`.
    fn client_handshake(stream: &mut TcpStream, secret: &str) -> u8 {
        assert_eq!(stream.read_i32_be().unwrap(), PROTOCOL_VERSION);
        stream.write_u8(RET_SUCCESS).unwrap();
        let mut challenge = [0u8; CHALLENGE_LEN];
        stream.read_exact(&mut challenge).unwrap();
        stream.write_i32_be(auth_response(secret, &challenge)).unwrap();
        stream.read_u8().unwrap()
    }

    #[test]
    fn test_handshake_accepts_shared_secret() {
        let mut handle = spawn_server(ServerOptions::default(), Arc::new(TracingObserver));
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        assert_eq!(client_handshake(&mut stream, DEFAULT_SECRET), RET_SUCCESS);

        stream.write_u8(0x10).unwrap();
        assert_eq!(stream.read_u8().unwrap(), RET_SUCCESS);
        assert_eq!(stream.read_i32_be().unwrap(), 1);

        stream.write_u8(0x08).unwrap();
        handle.stop();
    }

    #[test]
    fn test_wrong_secret_is_rejected_and_closed() {
        let recorder = Arc::new(RecordingObserver::default());
        let mut handle = spawn_server(ServerOptions::default(), recorder.clone());
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();

        assert_eq!(client_handshake(&mut stream, "wrong"), RET_FAILURE);
        assert_eq!(stream.read_utf().unwrap(), AUTH_FAILED_MESSAGE);
        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);

        handle.stop();
        let events = recorder.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, BusEvent::AuthenticationFailed { .. })));
        assert!(events.iter().any(|e| matches!(e, BusEvent::ServerStopped)));
    }

    #[test]
    fn test_version_rejection_drops_connection() {
        let mut handle = spawn_server(ServerOptions::default(), Arc::new(TracingObserver));
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        assert_eq!(stream.read_i32_be().unwrap(), PROTOCOL_VERSION);
        stream.write_u8(RET_FAILURE).unwrap();
        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
        handle.stop();
    }

    #[test]
    fn test_stop_disconnects_idle_clients() {
        let mut handle = spawn_server(ServerOptions::default(), Arc::new(TracingObserver));
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        assert_eq!(client_handshake(&mut stream, DEFAULT_SECRET), RET_SUCCESS);

        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.active_connections() == 0 && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        assert_eq!(handle.active_connections(), 1);

        handle.stop();
        handle.stop();
        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).unwrap_or(0), 0);
    }

    #[test]
    fn test_client_accepted_while_stopping_is_closed() {
        let bus = VirtualBus::with_devices(&[Address::with_crc(0x28, [1, 2, 3, 4, 5, 6])]);
        let options = ServerOptions {
            multithreaded: false,
            ..ServerOptions::default()
        };
        let server = ProxyServer::bind("127.0.0.1:0", Box::new(SimAdapter::new(bus)), options).unwrap();
        server.shared.stopping.store(true, Ordering::Release);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        server.accept(stream, peer).unwrap();

        assert!(lock(&server.shared.connections).is_empty());
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap_or(0), 0);
    }

    #[test]
    fn test_single_threaded_idle_timeout() {
        let options = ServerOptions {
            multithreaded: false,
            idle_timeout: Duration::from_millis(200),
            ..ServerOptions::default()
        };
        let mut handle = spawn_server(options, Arc::new(TracingObserver));

        let mut first = TcpStream::connect(handle.local_addr()).unwrap();
        assert_eq!(client_handshake(&mut first, DEFAULT_SECRET), RET_SUCCESS);
        // The idle first client times out, then the second one is served.
        let mut second = TcpStream::connect(handle.local_addr()).unwrap();
        assert_eq!(client_handshake(&mut second, DEFAULT_SECRET), RET_SUCCESS);

        let mut rest = Vec::new();
        assert_eq!(first.read_to_end(&mut rest).unwrap_or(0), 0);
        handle.stop();
    }
}
