//! A stand-in upstream service for trying the relay end to end.
//!
//! Accepts a single connection, logs every line it receives and pushes a
//! `Server event <n>` line every few seconds, where `n` is the number of
//! seconds it waited. With `echo` on, each received line is also written
//! straight back.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::info;

#[derive(Clone, Debug)]
pub struct DemoOptions {
    pub echo: bool,
    /// Lower bound of the random wait between events, in seconds.
    pub min_interval_secs: u64,
    /// Upper bound (exclusive) before the extra second is added.
    pub max_interval_secs: u64,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            echo: false,
            min_interval_secs: 5,
            max_interval_secs: 10,
        }
    }
}

impl DemoOptions {
    /// Seconds until the next event: uniform in `[min, max)` plus one.
    fn next_wait_secs(&self, rng: &mut impl Rng) -> u64 {
        let base = if self.max_interval_secs > self.min_interval_secs {
            rng.random_range(self.min_interval_secs..self.max_interval_secs)
        } else {
            self.min_interval_secs
        };
        base + 1
    }
}

/// Serve one relay connection until it disconnects.
pub async fn run(listener: TcpListener, options: DemoOptions) -> Result<()> {
    info!(
        "Listening for incoming connection on {}",
        listener.local_addr()?
    );
    let (stream, peer) = listener
        .accept()
        .await
        .context("error accepting relay connection")?;
    info!("Relay connected from {}", peer);

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut rng = StdRng::from_os_rng();

    let mut wait = options.next_wait_secs(&mut rng);
    let timer = tokio::time::sleep(Duration::from_secs(wait));
    tokio::pin!(timer);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("error reading from relay")? else {
                    info!("Connection dropped. Exiting.");
                    break;
                };
                info!("{}", line.trim());
                if options.echo {
                    writer.write_all(format!("{}\n", line).as_bytes()).await?;
                }
            }
            _ = &mut timer => {
                let event = format!("Server event {}", wait);
                info!("{}", event);
                if let Err(e) = writer.write_all(format!("{}\n", event).as_bytes()).await {
                    info!("Connection dropped ({}). Exiting.", e);
                    break;
                }
                wait = options.next_wait_secs(&mut rng);
                timer.as_mut().reset(Instant::now() + Duration::from_secs(wait));
            }
        }
    }

    Ok(())
}
