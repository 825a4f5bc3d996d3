use std::{
    io,
    net::{AddrParseError, IpAddr, SocketAddr, UdpSocket},
    sync::Arc,
};

use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpSocket},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_util::task::TaskTracker;

use crate::{
    acceptor::Acceptor,
    diagnostics::Diagnostics,
    registry::SessionRegistry,
    session::{self, Responder, SessionContext, SessionId},
};

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("invalid address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        source: AddrParseError,
    },
    #[error("address {0} is not bound to this host")]
    ForeignAddress(IpAddr),
    #[error("backlog must be at least 1")]
    InvalidBacklog,
    #[error("buffer size must be at least 1 byte")]
    InvalidBufferSize,
    #[error("cannot bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("cannot listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },
}

/// Validated once, then fixed for as long as the server stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub backlog: u32,
    pub buffer_size: usize,
}

impl ServerConfig {
    pub fn new(
        address: &str,
        port: u16,
        backlog: u32,
        buffer_size: usize,
    ) -> Result<Self, OpenError> {
        let ip: IpAddr = address
            .parse()
            .map_err(|source| OpenError::InvalidAddress {
                address: address.to_string(),
                source,
            })?;
        if !(ip.is_loopback() || ip.is_unspecified() || is_host_address(ip)) {
            return Err(OpenError::ForeignAddress(ip));
        }
        if backlog == 0 {
            return Err(OpenError::InvalidBacklog);
        }
        if buffer_size == 0 {
            return Err(OpenError::InvalidBufferSize);
        }
        Ok(Self {
            address: ip,
            port,
            backlog,
            buffer_size,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    fn listen(&self) -> Result<TcpListener, OpenError> {
        let addr = self.socket_addr();
        let bind_err = |source| OpenError::Bind { addr, source };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        #[cfg(unix)]
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        socket
            .listen(self.backlog)
            .map_err(|source| OpenError::Listen { addr, source })
    }
}

/// an address belongs to this host if something can bind to it
fn is_host_address(ip: IpAddr) -> bool {
    UdpSocket::bind((ip, 0)).is_ok()
}

struct Running {
    config: ServerConfig,
    local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    acceptor: JoinHandle<()>,
    sessions: TaskTracker,
}

/// TCP server sending back what every client sends.
///
/// `open` must be called from within a tokio runtime. Dropping the server
/// stops accepting and forces every session closed without waiting for them.
pub struct EchoServer {
    responder: Responder,
    diagnostics: Arc<Diagnostics>,
    registry: Arc<SessionRegistry>,
    running: Option<Running>,
}

impl EchoServer {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self::from_responder(diagnostics, session::echo())
    }

    pub fn with_responder<F>(diagnostics: Diagnostics, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Bytes + Send + Sync + 'static,
    {
        Self::from_responder(diagnostics, Arc::new(responder))
    }

    fn from_responder(diagnostics: Diagnostics, responder: Responder) -> Self {
        Self {
            responder,
            diagnostics: Arc::new(diagnostics),
            registry: Arc::new(SessionRegistry::new()),
            running: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn config(&self) -> Option<&ServerConfig> {
        self.running.as_ref().map(|r| &r.config)
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn sessions(&self) -> Vec<(SessionId, SocketAddr)> {
        self.registry.snapshot()
    }

    /// Failures are reported to the diagnostics and turned into `false`.
    /// Opening an open server does nothing and succeeds.
    pub fn open(&mut self, address: &str, port: u16, backlog: u32, buffer_size: usize) -> bool {
        match self.try_open(address, port, backlog, buffer_size) {
            Ok(_) => true,
            Err(err) => {
                self.diagnostics.report(format!("cannot open server: {err}"));
                false
            }
        }
    }

    /// Like `open`, without reporting. Returns the address actually bound.
    pub fn try_open(
        &mut self,
        address: &str,
        port: u16,
        backlog: u32,
        buffer_size: usize,
    ) -> Result<SocketAddr, OpenError> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }
        let config = ServerConfig::new(address, port, backlog, buffer_size)?;
        self.open_with(config)
    }

    pub fn open_with(&mut self, config: ServerConfig) -> Result<SocketAddr, OpenError> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let listener = config.listen()?;
        let local_addr = listener.local_addr().map_err(|source| OpenError::Listen {
            addr: config.socket_addr(),
            source,
        })?;

        let ctx = SessionContext {
            buffer_size: config.buffer_size,
            responder: Arc::clone(&self.responder),
            registry: Arc::downgrade(&self.registry),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        let sessions = TaskTracker::new();
        let acceptor = Acceptor::new(
            listener,
            Arc::clone(&self.registry),
            ctx,
            sessions.clone(),
        );
        let (stop, stopped) = oneshot::channel();
        let acceptor = tokio::spawn(acceptor.run(stopped));
        tracing::info!("listening on {local_addr}");

        self.running = Some(Running {
            config,
            local_addr,
            stop,
            acceptor,
            sessions,
        });
        Ok(local_addr)
    }

    /// Stop accepting, force every session closed and wait until they
    /// are all gone. Closing a closed server does nothing.
    pub async fn close(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.stop.send(());
        if let Err(err) = running.acceptor.await {
            tracing::error!("acceptor for {} died: {err}", running.local_addr);
        }
        self.shut_down_sessions();
        running.sessions.close();
        running.sessions.wait().await;
        tracing::info!("closed server on {}", running.local_addr);
    }

    fn shut_down_sessions(&self) {
        for (id, handle) in self.registry.drain() {
            tracing::debug!("forcing session {id} with {} closed", handle.peer());
            handle.shut_down();
        }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop.send(());
            running.sessions.close();
        }
        self.shut_down_sessions();
    }
}
