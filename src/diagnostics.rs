use crate::logsink::LogSink;

/// Where the server sends its error reports.
///
/// Notification and persistent logging are enabled independently. A
/// notification is an `error` level tracing event on the `notify` target.
#[derive(Debug, Default)]
pub struct Diagnostics {
    notify: bool,
    log: Option<LogSink>,
}

impl Diagnostics {
    pub fn new(notify: bool, log: Option<LogSink>) -> Self {
        Self { notify, log }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn report(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        if self.notify {
            tracing::error!(target: "tcp_echo::notify", "{message}");
        } else {
            tracing::debug!("{message}");
        }
        if let Some(log) = &self.log {
            log.record(message);
        }
    }

    pub async fn flush(&self) {
        if let Some(log) = &self.log {
            log.flush().await;
        }
    }
}
