use std::fs::File;
use std::io::{self, BufReader, Read};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::parse::{parse_event, ParseError, SAMPLE_SIZE};
use super::{ErrorHandler, EventHandler, EventSource};

/// How long `stop` waits for a reader blocked on input before detaching it.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Replays consecutive fixed-size samples from a file or stdin (`-`).
pub struct ReplaySource {
    path: String,
    event_handlers: Vec<EventHandler>,
    error_handlers: Vec<ErrorHandler>,
    read_task: Option<JoinHandle<Result<u64>>>,
}

impl ReplaySource {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            event_handlers: Vec::new(),
            error_handlers: Vec::new(),
            read_task: None,
        }
    }

    /// Waits for the input to be exhausted. Returns the number of samples
    /// delivered to the event handlers.
    pub async fn join(&mut self) -> Result<u64> {
        match self.read_task.take() {
            Some(handle) => handle.await.context("waiting for replay task")?,
            None => Ok(0),
        }
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        if self.path == "-" {
            return Ok(Box::new(io::stdin()));
        }
        let file =
            File::open(&self.path).with_context(|| format!("opening event source {}", self.path))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

impl std::fmt::Debug for ReplaySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySource")
            .field("path", &self.path)
            .field("running", &self.read_task.is_some())
            .finish()
    }
}

impl EventSource for ReplaySource {
    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let input = self.open()?;

        let event_handlers = Arc::new(std::mem::take(&mut self.event_handlers));
        let error_handlers = Arc::new(std::mem::take(&mut self.error_handlers));
        let path = self.path.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let delivered = read_loop(input, &event_handlers, &error_handlers, &ctx)
                .with_context(|| format!("reading event source {path}"));
            match &delivered {
                Ok(n) => tracing::info!(path = %path, samples = n, "event replay finished"),
                Err(e) => report_error(&error_handlers, anyhow::anyhow!("{e:#}")),
            }
            delivered
        });

        self.read_task = Some(handle);

        tracing::info!(path = %self.path, "replay source started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // The read loop notices cancellation between samples; a read blocked
        // on stdin is detached after the grace period.
        if let Some(handle) = self.read_task.take() {
            match tokio::time::timeout(STOP_GRACE, handle).await {
                Ok(joined) => {
                    joined.context("waiting for replay task")??;
                }
                Err(_) => tracing::debug!("replay input still blocked, detaching reader"),
            }
        }

        tracing::info!("replay source stopped");
        Ok(())
    }

    fn on_event(&mut self, handler: EventHandler) {
        self.event_handlers.push(handler);
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handlers.push(handler);
    }
}

/// Reads samples until EOF or cancellation. Undecodable samples are reported
/// and skipped.
fn read_loop(
    mut input: impl Read,
    event_handlers: &[EventHandler],
    error_handlers: &[ErrorHandler],
    cancel: &CancellationToken,
) -> io::Result<u64> {
    let mut buf = [0u8; SAMPLE_SIZE];
    let mut delivered = 0u64;

    while !cancel.is_cancelled() {
        let n = fill(&mut input, &mut buf)?;
        if n == 0 {
            break;
        }
        if n < SAMPLE_SIZE {
            report_error(error_handlers, ParseError::Truncated { size: n }.into());
            break;
        }

        match parse_event(&buf) {
            Ok(event) => {
                for handler in event_handlers {
                    handler(event);
                }
                delivered += 1;
            }
            Err(e) => {
                tracing::trace!(error = %e, "skipping undecodable sample");
                report_error(error_handlers, e.into());
            }
        }
    }

    Ok(delivered)
}

/// Reads until `buf` is full or EOF. Returns the number of bytes read.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn report_error(handlers: &[ErrorHandler], err: anyhow::Error) {
    match handlers.split_last() {
        None => tracing::warn!(error = %err, "event source error"),
        Some((last, rest)) => {
            for handler in rest {
                handler(anyhow::anyhow!("{err:#}"));
            }
            last(err);
        }
    }
}
