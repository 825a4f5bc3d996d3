use std::path::PathBuf;

use clap::Parser;
use tcp_echo::{utils::BoxResult, Diagnostics, EchoServer, LogSink};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    #[arg(long, default_value_t = 6789)]
    port: u16,

    /// maximum number of pending connections
    #[arg(long, default_value_t = 128)]
    backlog: u32,

    /// size of the per connection receive buffer
    #[arg(long, default_value_t = 4096)]
    buffer_size: usize,

    /// append errors to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// don't notify errors on the console
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> BoxResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let log = cli.log_file.map(LogSink::spawn).transpose()?;
    let mut server = EchoServer::new(Diagnostics::new(!cli.quiet, log));
    if !server.open(&cli.address, cli.port, cli.backlog, cli.buffer_size) {
        server.diagnostics().flush().await;
        return Err(format!("cannot open server on {}:{}", cli.address, cli.port).into());
    }
    if let Some(addr) = server.local_addr() {
        tracing::info!("echoing on {addr}, ctrl-c to stop");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.close().await;
    // sessions may have reported errors on their way out
    server.diagnostics().flush().await;
    Ok(())
}
