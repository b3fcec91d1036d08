//! Server lifecycle: bind, accept, serve, stop.
//!
//! A [`Server`] owns a listener and, unless an external runtime is
//! configured, a multi-thread runtime whose worker threads serve the
//! connections. Each accepted connection runs the request pipeline as one
//! task.
//!
//! ```rust,no_run
//! use wicket::{Config, Headers, HttpServer, Request, Response, Router};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/hello", |_: &mut Request, res: &mut Response| {
//!         res.write_ok("Hello, World!", &Headers::new());
//!     })?;
//!
//!     let server = HttpServer::new(Config::new(8080).workers(4), router);
//!     server.start()?; // blocks until stop() is called from another thread
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod gate;
pub(crate) mod pipeline;
pub mod registry;
pub mod session;
pub mod tls;
pub mod transport;

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use config::Config;
pub use error::{ErrorKind, ServeError, ServerError};
pub use gate::ShutdownGate;
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use session::Stage;
pub use tls::TlsError;
pub use transport::{PlainTransport, TlsTransport, Transport};

use crate::http::Request;
use crate::router::Router;

/// Pending connections the OS queues for the listener.
const LISTEN_BACKLOG: u32 = 1024;

/// Receives every error the pipeline abandons an exchange over. The request
/// is present once its header block has been parsed.
pub type ErrorHandler = Arc<dyn Fn(Option<&Request>, &ServeError) + Send + Sync + 'static>;

/// State shared by the acceptor and every connection task.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) router: Router,
    on_error: Option<ErrorHandler>,
    pub(crate) gate: Arc<ShutdownGate>,
    pub(crate) registry: Arc<ConnectionRegistry>,
}

impl Shared {
    pub(crate) fn new(config: Config, router: Router) -> Self {
        Self {
            config,
            router,
            on_error: None,
            gate: ShutdownGate::new(),
            registry: ConnectionRegistry::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&Request>, &ServeError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Hands `error` to the error handler. Deliberate closes are dropped,
    /// and nothing is delivered once the gate has closed.
    pub(crate) fn report(&self, request: Option<&Request>, error: &ServeError) {
        if error.is_aborted() {
            debug!("connection aborted");
            return;
        }
        let Some(_token) = self.gate.enter() else {
            return;
        };
        match request {
            Some(request) => warn!(
                method = %request.method(),
                path = request.path(),
                error = %error,
                "request failed"
            ),
            None => warn!(error = %error, "connection failed"),
        }
        if let Some(on_error) = &self.on_error {
            on_error(request, error);
        }
    }
}

#[derive(Default)]
struct State {
    runtime: Option<Runtime>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
}

/// An HTTP/1.1 server generic over its [`Transport`].
///
/// Use [`HttpServer`] for plain TCP and [`HttpsServer`] for TLS. Both share
/// the whole pipeline; only the handshake differs.
///
/// The server is `Sync`: [`stop`](Self::stop) may be called from another
/// thread while [`start`](Self::start) is blocking.
pub struct Server<T: Transport = PlainTransport> {
    shared: Arc<Shared>,
    transport: Arc<T>,
    stop: watch::Sender<bool>,
    state: Mutex<State>,
}

/// Plain HTTP server.
pub type HttpServer = Server<PlainTransport>;

/// HTTPS server.
pub type HttpsServer = Server<TlsTransport>;

impl Server<PlainTransport> {
    pub fn new(config: Config, router: Router) -> Self {
        Self::with_transport(config, router, PlainTransport)
    }
}

impl Server<TlsTransport> {
    /// Creates an HTTPS server from PEM files.
    ///
    /// When `verify_file` is given, clients must present a certificate
    /// issued by one of the roots it contains.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Tls`] if a file cannot be read or the
    /// certificate and key do not form a valid configuration.
    pub fn https(
        config: Config,
        router: Router,
        cert_file: impl AsRef<Path>,
        private_key_file: impl AsRef<Path>,
        verify_file: Option<&Path>,
    ) -> Result<Self, ServerError> {
        let transport = TlsTransport::from_files(cert_file, private_key_file, verify_file)?;
        Ok(Self::with_transport(config, router, transport))
    }
}

impl<T: Transport> Server<T> {
    pub fn with_transport(config: Config, router: Router, transport: T) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, router)),
            transport: Arc::new(transport),
            stop: watch::Sender::new(false),
            state: Mutex::new(State::default()),
        }
    }

    /// Registers the error handler. Must be called before the server
    /// starts accepting.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&Request>, &ServeError) + Send + Sync + 'static,
    {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.on_error = Some(Arc::new(handler)),
            None => warn!("server is already running; error handler ignored"),
        }
        self
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address the listener is bound to, once [`bind`](Self::bind) succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    /// Connections currently open.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Binds the listening socket and returns the bound port, which is the
    /// OS-assigned one when the configured port is `0`.
    ///
    /// Creates the internal runtime first if no external one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Address`] for an unresolvable address and
    /// [`ServerError::Bind`] if the socket cannot be bound.
    pub fn bind(&self) -> Result<u16, ServerError> {
        if *self.stop.borrow() {
            return Err(ServerError::Stopped);
        }
        let addr = self.socket_addr()?;

        let mut state = self.lock();
        let handle = match &self.shared.config.runtime {
            Some(handle) => handle.clone(),
            None => {
                let runtime = match state.runtime.take() {
                    Some(runtime) => runtime,
                    None => build_runtime(self.shared.config.workers)?,
                };
                let handle = runtime.handle().clone();
                state.runtime = Some(runtime);
                handle
            }
        };

        let _enter = handle.enter();
        let listener = listen(addr, self.shared.config.reuse_address).map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        info!(scheme = T::SCHEME, address = %local_addr, "listening");

        state.listener = Some(listener);
        state.local_addr = Some(local_addr);
        Ok(local_addr.port())
    }

    fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        let Config { address, port, .. } = &self.shared.config;
        if address.is_empty() {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), *port));
        }
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, *port));
        }
        (address.as_str(), *port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ServerError::Address { addr: address.clone() })
    }

    /// Starts accepting connections on the bound listener.
    ///
    /// With the internal runtime this blocks until [`stop`](Self::stop) is
    /// called, then releases the worker threads. With an external runtime
    /// the acceptor is spawned on it and this returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotBound`] if [`bind`](Self::bind) has not
    /// succeeded, or the listener was already handed to an acceptor.
    pub fn accept_and_run(&self) -> Result<(), ServerError> {
        let (listener, runtime) = {
            let mut state = self.lock();
            let listener = state.listener.take().ok_or(ServerError::NotBound)?;
            (listener, state.runtime.take())
        };
        let acceptor = accept(
            Arc::clone(&self.shared),
            Arc::clone(&self.transport),
            listener,
            self.stop.subscribe(),
        );

        match (runtime, &self.shared.config.runtime) {
            (Some(runtime), _) => {
                runtime.block_on(acceptor);
                drop(runtime);
                info!(scheme = T::SCHEME, "server stopped");
            }
            (None, Some(handle)) => {
                handle.spawn(acceptor);
            }
            (None, None) => return Err(ServerError::NotBound),
        }
        Ok(())
    }

    /// [`bind`](Self::bind) followed by [`accept_and_run`](Self::accept_and_run).
    pub fn start(&self) -> Result<(), ServerError> {
        self.bind()?;
        self.accept_and_run()
    }

    /// Stops accepting and closes every open connection. Idempotent; a
    /// stopped server cannot be bound again.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!(scheme = T::SCHEME, "stopping server");
        }
        self.shared.registry.close_all();
    }
}

impl<T: Transport> Drop for Server<T> {
    fn drop(&mut self) {
        self.shared.gate.shutdown();
        self.stop();
        if let Some(runtime) = self.lock().runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn build_runtime(workers: usize) -> Result<Runtime, ServerError> {
    Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .thread_name("wicket-worker")
        .enable_all()
        .build()
        .map_err(ServerError::Runtime)
}

fn listen(addr: SocketAddr, reuse_address: bool) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(reuse_address)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped sender means the server is gone, which also stops us.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Accepts connections until stopped, spawning one pipeline task each.
async fn accept<T: Transport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    listener: TcpListener,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            accepted = listener.accept() => accepted,
        };
        let Some(_token) = shared.gate.enter() else {
            break;
        };

        match accepted {
            Ok((tcp, peer)) => {
                if let Err(err) = tcp.set_nodelay(true) {
                    debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
                }
                let registration = shared.registry.register(Some(peer));
                // stop() may have cleared the registry between accept and register.
                if *stop.borrow() {
                    registration.handle().close();
                }
                debug!(peer = %peer, connection = registration.handle().id(), "connection accepted");
                tokio::spawn(pipeline::serve(
                    Arc::clone(&shared),
                    Arc::clone(&transport),
                    tcp,
                    registration,
                ));
            }
            Err(err) => shared.report(None, &ServeError::transport(Stage::Accepting, err)),
        }
    }
    debug!("acceptor closed");
}
