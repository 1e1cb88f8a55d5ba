//! Entry point for `udp-stream`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  The server answers file requests from a directory; the client
//! fetches one file.  All protocol work is delegated to the library;
//! `main.rs` owns only process setup (logging, argument parsing).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use udp_stream::transfer::{self, Served};
use udp_stream::{Acceptor, Connector, Stream, StreamConfig};

/// Reliable byte streams over UDP, with a small file-transfer demo.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve files from a directory to connecting clients.
    Server {
        /// Port to listen on.
        port: u16,
        /// Directory files are served from.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
        /// Probability of dropping each received datagram (0.0 – 1.0).
        #[arg(short, long, default_value_t = 0.0)]
        loss: f64,
        /// Upper bound on bytes in flight.
        #[arg(short, long)]
        window: Option<usize>,
        /// Seed for the loss simulator, for reproducible runs.
        #[arg(long)]
        seed: Option<u64>,
        /// Exit after serving one client.
        #[arg(long)]
        once: bool,
    },
    /// Fetch one file from a server.
    Client {
        host: String,
        port: u16,
        /// Name of the file to request.
        file: String,
        /// Where to write it (defaults to the requested name).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Probability of dropping each received datagram (0.0 – 1.0).
        #[arg(short, long, default_value_t = 0.0)]
        loss: f64,
        /// Upper bound on bytes in flight.
        #[arg(short, long)]
        window: Option<usize>,
        /// Seed for the loss simulator, for reproducible runs.
        #[arg(long)]
        seed: Option<u64>,
    },
}

/// How long either side waits for a complete message.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);

fn stream_config(loss: f64, window: Option<usize>, seed: Option<u64>) -> StreamConfig {
    let mut config = StreamConfig::default().with_loss(loss);
    if let Some(bytes) = window {
        config = config.with_window_limit(bytes);
    }
    if let Some(seed) = seed {
        config = config.with_loss_seed(seed);
    }
    config
}

fn warn_privileged(port: u16) {
    if port <= 1024 {
        log::warn!("port {port} is in the privileged range; binding may require root");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            port,
            root,
            loss,
            window,
            seed,
            once,
        } => {
            warn_privileged(port);
            let acceptor = Acceptor::bind(port)
                .await
                .with_context(|| format!("listening on port {port}"))?;
            log::info!("Serving {} on port {}", root.display(), acceptor.port());

            loop {
                let stream = Stream::accept(&acceptor, stream_config(loss, window, seed)).await?;
                log::info!("Accepted {:?}", stream.peer_addr());
                match transfer::serve_request(&stream, &root, MESSAGE_TIMEOUT).await {
                    Ok(Served::Sent { filename, bytes }) => {
                        log::info!("Sent {filename} ({bytes} bytes)")
                    }
                    Ok(Served::Denied { filename }) => log::info!("Denied {filename}"),
                    Err(e) => log::warn!("Request failed: {e}"),
                }
                if let Err(e) = stream.close().await {
                    log::warn!("Close: {e}");
                }
                if once {
                    break;
                }
            }
        }
        Mode::Client {
            host,
            port,
            file,
            output,
            loss,
            window,
            seed,
        } => {
            warn_privileged(port);
            let connector = Connector::new(host.clone(), port);
            let stream = Stream::connect(&connector, stream_config(loss, window, seed))
                .await
                .with_context(|| format!("connecting to {host}:{port}"))?;

            let contents = transfer::fetch_file(&stream, &file, MESSAGE_TIMEOUT)
                .await
                .with_context(|| format!("fetching {file}"))?;
            let output = output.unwrap_or_else(|| PathBuf::from(&file));
            tokio::fs::write(&output, &contents)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            log::info!("Wrote {} bytes to {}", contents.len(), output.display());

            let stats = stream.stats();
            stream.close().await.context("closing stream")?;
            log::info!(
                "Done: {} segments sent, {} received, {} timeouts",
                stats.segments_sent,
                stats.segments_received,
                stats.retransmit_timeouts
            );
        }
    }
    Ok(())
}
