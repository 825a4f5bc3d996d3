mod acceptor;
pub mod diagnostics;
pub mod logsink;
pub mod registry;
pub mod server;
pub mod session;
pub mod utils;

pub use diagnostics::Diagnostics;
pub use logsink::{LogEntry, LogSink};
pub use registry::SessionRegistry;
pub use server::{EchoServer, OpenError, ServerConfig};
pub use session::{Responder, SessionHandle, SessionId};
