use std::{
    fmt,
    io::{self, ErrorKind},
    net::{Shutdown, SocketAddr},
    sync::{Arc, Weak},
};

use bytes::Bytes;
use socket2::SockRef;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
};

use crate::{diagnostics::Diagnostics, registry::SessionRegistry};

/// Turns the bytes of one read into the bytes sent back.
pub type Responder = Arc<dyn Fn(&[u8]) -> Bytes + Send + Sync>;

/// send back exactly what was received
pub fn echo() -> Responder {
    Arc::new(|data: &[u8]| Bytes::copy_from_slice(data))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the registry keeps for a live session: enough to force it closed.
#[derive(Debug)]
pub struct SessionHandle {
    peer: SocketAddr,
    shutdown: oneshot::Sender<()>,
}

impl SessionHandle {
    /// the receiver goes to the session, it resolves when the handle is
    /// used or dropped
    pub fn new(peer: SocketAddr) -> (Self, oneshot::Receiver<()>) {
        let (shutdown, rx) = oneshot::channel();
        (Self { peer, shutdown }, rx)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn shut_down(self) {
        if self.shutdown.send(()).is_err() {
            tracing::trace!("session with {} already gone", self.peer);
        }
    }
}

/// Everything a session needs besides its own socket.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) buffer_size: usize,
    pub(crate) responder: Responder,
    pub(crate) registry: Weak<SessionRegistry>,
    pub(crate) diagnostics: Arc<Diagnostics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    PeerClosed,
    ForcedShutdown,
}

#[derive(Debug)]
enum State {
    Receiving,
    Echoing(Bytes),
    Closed(Exit),
}

pub(crate) struct Session {
    id: SessionId,
    peer: SocketAddr,
    stream: TcpStream,
    buffer: Vec<u8>,
    shutdown: oneshot::Receiver<()>,
    ctx: SessionContext,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        peer: SocketAddr,
        stream: TcpStream,
        shutdown: oneshot::Receiver<()>,
        ctx: SessionContext,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            buffer: vec![0; ctx.buffer_size],
            shutdown,
            ctx,
        }
    }

    /// Serve the connection until the peer closes it, the server forces it
    /// closed, or an I/O error. Always leaves the registry on the way out.
    pub(crate) async fn run(mut self) {
        tracing::info!("session {} serving {}", self.id, self.peer);
        match self.serve().await {
            Ok(Exit::PeerClosed) => tracing::info!("{} closed the connection", self.peer),
            Ok(Exit::ForcedShutdown) => {
                tracing::debug!("session {} shut down by the server", self.id)
            }
            Err(err) => {
                self.ctx.diagnostics.report(format!(
                    "session {} with {} failed: {err}",
                    self.id, self.peer
                ));
                self.close(Exit::ForcedShutdown);
            }
        }

        if let Some(registry) = self.ctx.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    async fn serve(&mut self) -> io::Result<Exit> {
        let mut state = State::Receiving;
        loop {
            state = match state {
                State::Receiving => self.receive().await?,
                State::Echoing(reply) => self.echo(reply).await?,
                State::Closed(exit) => return Ok(exit),
            };
        }
    }

    async fn receive(&mut self) -> io::Result<State> {
        let read = tokio::select! {
            _ = &mut self.shutdown => None,
            read = self.stream.read(&mut self.buffer) => Some(read),
        };
        let n = match read {
            None => return Ok(self.close(Exit::ForcedShutdown)),
            Some(read) => read?,
        };
        if n == 0 {
            return Ok(self.close(Exit::PeerClosed));
        }

        tracing::trace!("session {} got {n} bytes", self.id);
        Ok(State::Echoing((self.ctx.responder)(&self.buffer[..n])))
    }

    async fn echo(&mut self, reply: Bytes) -> io::Result<State> {
        let written = tokio::select! {
            _ = &mut self.shutdown => None,
            written = self.stream.write_all(&reply) => Some(written),
        };
        match written {
            None => Ok(self.close(Exit::ForcedShutdown)),
            Some(written) => {
                written?;
                Ok(State::Receiving)
            }
        }
    }

    fn close(&self, exit: Exit) -> State {
        match SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            // the peer may already be gone
            Err(err) if err.kind() == ErrorKind::NotConnected => (),
            Err(err) => tracing::debug!("error shutting down {}: {err}", self.peer),
            Ok(()) => (),
        }
        State::Closed(exit)
    }
}
