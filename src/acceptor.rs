use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_util::task::TaskTracker;

use crate::{
    registry::SessionRegistry,
    session::{Session, SessionContext, SessionHandle, SessionId},
};

/// pause after a failed accept, a pending connection that can't be
/// accepted (out of file descriptors) would otherwise fail again at once
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of inbound connections.
#[async_trait::async_trait]
pub(crate) trait Incoming: Send + 'static {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait::async_trait]
impl Incoming for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Owns the listening socket. Closing the socket means stopping the acceptor.
pub(crate) struct Acceptor<L = TcpListener> {
    listener: L,
    registry: Arc<SessionRegistry>,
    ctx: SessionContext,
    sessions: TaskTracker,
    session_id_counter: u64,
    backoff: Duration,
}

impl<L: Incoming> Acceptor<L> {
    pub(crate) fn new(
        listener: L,
        registry: Arc<SessionRegistry>,
        ctx: SessionContext,
        sessions: TaskTracker,
    ) -> Self {
        Self {
            listener,
            registry,
            ctx,
            sessions,
            session_id_counter: 0,
            backoff: ACCEPT_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Accept until `stop` fires or its sender is dropped. There is only
    /// ever one accept in flight.
    pub(crate) async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        loop {
            let accepted = tokio::select! {
                _ = &mut stop => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.hand_off(stream, peer),
                Err(err) => {
                    self.ctx
                        .diagnostics
                        .report(format!("error while accepting a connection: {err}"));
                    tokio::select! {
                        _ = &mut stop => break,
                        _ = tokio::time::sleep(self.backoff) => (),
                    }
                }
            }
        }
        tracing::info!(
            "acceptor stopped after {} connections",
            self.session_id_counter
        );
    }

    // register first so a close racing with the new session still sees it
    fn hand_off(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = SessionId(self.session_id_counter);
        self.session_id_counter += 1;
        tracing::debug!("incoming connection from {peer}, session {id}");

        let (handle, shutdown) = SessionHandle::new(peer);
        self.registry.add(id, handle);
        let session = Session::new(id, peer, stream, shutdown, self.ctx.clone());
        self.sessions.spawn(session.run());
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        diagnostics::Diagnostics,
        logsink::LogSink,
        session,
        utils::{AbortHdl, BoxResult},
    };
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        time::timeout,
    };

    fn context(registry: &Arc<SessionRegistry>, diagnostics: Diagnostics) -> SessionContext {
        SessionContext {
            buffer_size: 64,
            responder: session::echo(),
            registry: Arc::downgrade(registry),
            diagnostics: Arc::new(diagnostics),
        }
    }

    async fn echo_byte(client: &mut TcpStream, byte: u8) -> BoxResult<u8> {
        client.write_all(&[byte]).await?;
        let mut buf = [0; 1];
        timeout(Duration::from_millis(500), client.read_exact(&mut buf))
            .await
            .map_err(|_| "no echo")??;
        Ok(buf[0])
    }

    /// fails the first `failures` accepts the way a process out of file
    /// descriptors does, then hands out real connections
    struct Exhausted {
        listener: TcpListener,
        failures: usize,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Incoming for Exhausted {
        async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
            } else {
                self.listener.accept().await
            }
        }
    }

    #[tokio::test]
    async fn test_accepts_then_stops() -> BoxResult<()> {
        let _ = tracing_subscriber::fmt::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let registry = Arc::new(SessionRegistry::new());
        let ctx = context(&registry, Diagnostics::disabled());
        let sessions = TaskTracker::new();
        let acceptor = Acceptor::new(listener, Arc::clone(&registry), ctx, sessions.clone());
        let (stop, stopped) = oneshot::channel();
        let mut hdl = AbortHdl(tokio::spawn(acceptor.run(stopped)));

        let mut clients = Vec::new();
        for i in 0..3u8 {
            let mut client = TcpStream::connect(addr).await?;
            assert_eq!(echo_byte(&mut client, i).await?, i);
            clients.push(client);
        }
        assert_eq!(registry.len(), 3);
        let ids: Vec<SessionId> = registry.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![SessionId(0), SessionId(1), SessionId(2)]);

        stop.send(()).map_err(|_| "acceptor gone")?;
        timeout(Duration::from_millis(500), &mut hdl.0)
            .await
            .expect("acceptor exits")?;
        assert!(
            TcpStream::connect(addr).await.is_err(),
            "listening socket is closed"
        );

        // sessions outlive the acceptor until they are told to stop
        assert_eq!(registry.len(), 3);
        registry.clear();
        sessions.close();
        timeout(Duration::from_millis(500), sessions.wait())
            .await
            .expect("sessions exit");
        Ok(())
    }

    #[tokio::test]
    async fn test_backs_off_on_accept_errors() -> BoxResult<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let registry = Arc::new(SessionRegistry::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let incoming = Exhausted {
            listener,
            failures: usize::MAX,
            attempts: Arc::clone(&attempts),
        };
        let acceptor = Acceptor::new(
            incoming,
            Arc::clone(&registry),
            context(&registry, Diagnostics::disabled()),
            TaskTracker::new(),
        )
        .with_backoff(Duration::from_millis(50));
        let (stop, stopped) = oneshot::channel();
        let mut hdl = AbortHdl(tokio::spawn(acceptor.run(stopped)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let seen = attempts.load(Ordering::SeqCst);
        assert!(seen >= 2, "keeps accepting after an error, got {seen}");
        assert!(seen <= 10, "no busy loop on accept errors, got {seen}");

        // the stop signal interrupts the backoff
        stop.send(()).map_err(|_| "acceptor gone")?;
        timeout(Duration::from_millis(100), &mut hdl.0)
            .await
            .expect("acceptor exits during backoff")?;
        Ok(())
    }

    #[tokio::test]
    async fn test_reports_accept_errors_and_continues() -> BoxResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("errors.log");
        let diagnostics = Diagnostics::new(false, Some(LogSink::spawn(&path)?));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let registry = Arc::new(SessionRegistry::new());
        let ctx = context(&registry, diagnostics);
        let diagnostics = Arc::clone(&ctx.diagnostics);
        let incoming = Exhausted {
            listener,
            failures: 2,
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        let acceptor = Acceptor::new(incoming, Arc::clone(&registry), ctx, TaskTracker::new())
            .with_backoff(Duration::from_millis(10));
        let (_stop, stopped) = oneshot::channel();
        let _hdl = AbortHdl(tokio::spawn(acceptor.run(stopped)));

        let mut client = TcpStream::connect(addr).await?;
        assert_eq!(echo_byte(&mut client, 42).await?, 42);
        assert_eq!(registry.len(), 1);

        diagnostics.flush().await;
        let content = std::fs::read_to_string(&path)?;
        let reports: Vec<&str> = content.lines().collect();
        assert_eq!(reports.len(), 2, "got {content:?}");
        for report in reports {
            assert!(report.ends_with(",error while accepting a connection: too many open files"));
        }
        Ok(())
    }
}
