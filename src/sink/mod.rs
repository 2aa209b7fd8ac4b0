use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SinkConfig;
use crate::drain::{ReadOutcome, Reader};

/// Sink consumes drained flow records and exports them.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Begin draining.
    fn start(
        &mut self,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Wait for draining to finish. The context passed to `start` must be
    /// cancelled first.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Writes one text line per drained record to a file or stdout (`-`).
pub struct RecordSink {
    cfg: SinkConfig,
    reader: Option<Reader>,
    drain_task: Option<JoinHandle<Result<u64>>>,
}

impl RecordSink {
    pub fn new(cfg: SinkConfig, reader: Reader) -> Self {
        Self {
            cfg,
            reader: Some(reader),
            drain_task: None,
        }
    }

    fn open(&self) -> Result<Box<dyn Write + Send>> {
        if self.cfg.path == "-" {
            return Ok(Box::new(io::stdout()));
        }
        let file = File::create(&self.cfg.path)
            .with_context(|| format!("creating record sink {}", self.cfg.path))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

impl std::fmt::Debug for RecordSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSink")
            .field("path", &self.cfg.path)
            .field("buffer_size", &self.cfg.buffer_size)
            .finish()
    }
}

impl Sink for RecordSink {
    fn name(&self) -> &str {
        "records"
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| anyhow::anyhow!("record sink already started"))?;
        let mut out = self.open()?;
        let buffer_size = self.cfg.buffer_size;

        self.drain_task = Some(tokio::task::spawn_blocking(move || {
            drain_loop(&mut reader, &mut out, buffer_size, &ctx)
        }));

        tracing::info!(path = %self.cfg.path, buffer_size, "record sink started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.drain_task.take() {
            let records = handle.await.context("waiting for drain task")??;
            tracing::info!(records, "record sink stopped");
        }
        Ok(())
    }
}

/// Drains records into `out` until `cancel` fires or the tracker closes.
///
/// Each batch is flushed as soon as it is written. The buffer grows when a
/// single record does not fit. Returns the number of records written.
pub fn drain_loop<W: Write + ?Sized>(
    reader: &mut Reader,
    out: &mut W,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut records = 0u64;

    loop {
        match reader.read_batch(&mut buf, cancel) {
            ReadOutcome::Record(n) => {
                let batch = &buf[..n];
                out.write_all(batch).context("writing records")?;
                out.flush().context("flushing records")?;
                records += batch.iter().filter(|b| **b == b'\n').count() as u64;
            }
            ReadOutcome::BufferTooSmall { needed } => {
                tracing::debug!(needed, current = buf.len(), "growing drain buffer");
                buf.resize(needed, 0);
            }
            ReadOutcome::NoData => {}
            ReadOutcome::Interrupted => break,
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TrackerConfig;
    use crate::flow::record::FlowIdentity;
    use crate::flow::FlowTracker;
    use crate::source::event::{FlowEvent, TcpFlags};

    fn tracker() -> Arc<FlowTracker> {
        let cfg = TrackerConfig {
            capacity: 8,
            ..TrackerConfig::default()
        };
        let clock = Arc::new(ManualClock::new(Duration::from_secs(3)));
        Arc::new(FlowTracker::new(&cfg, clock).expect("tracker builds"))
    }

    fn finish(t: &FlowTracker, sport: u16) {
        let id = FlowIdentity::new(Ipv4Addr::new(10, 0, 0, 1), sport, Ipv4Addr::new(10, 0, 0, 2), 80);
        t.ingest(&FlowEvent::receive(id, TcpFlags::SYN));
        t.ingest(&FlowEvent::receive(id, TcpFlags::RST));
    }

    #[test]
    fn test_drain_loop_writes_pending_then_stops_on_close() {
        let t = tracker();
        let mut reader = t.open_reader();
        for sport in 1..=3 {
            finish(&t, sport);
        }
        t.close();

        let mut out = Vec::new();
        let n = drain_loop(&mut reader, &mut out, 4096, &CancellationToken::new())
            .expect("drain to memory");
        assert_eq!(n, 3);
        let text = String::from_utf8(out).expect("ascii output");
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().all(|l| l.split_whitespace().nth(1) == Some("1")));
    }

    #[test]
    fn test_drain_loop_grows_tiny_buffer() {
        let t = tracker();
        let mut reader = t.open_reader();
        finish(&t, 7);
        t.close();

        let mut out = Vec::new();
        let n = drain_loop(&mut reader, &mut out, 4, &CancellationToken::new())
            .expect("drain to memory");
        assert_eq!(n, 1);
        assert!(out.ends_with(b"\n"));
    }

    #[test]
    fn test_drain_loop_cancelled_writes_nothing() {
        let t = tracker();
        let mut reader = t.open_reader();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut out = Vec::new();
        let n = drain_loop(&mut reader, &mut out, 256, &cancel).expect("drain to memory");
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_record_sink_writes_file() {
        let t = tracker();
        let path = std::env::temp_dir().join(format!("tcpflowspy-sink-{}.txt", std::process::id()));
        let cfg = SinkConfig {
            path: path.to_string_lossy().into_owned(),
            buffer_size: 64,
        };
        let mut sink = RecordSink::new(cfg, t.open_reader());
        assert_eq!(sink.name(), "records");

        let cancel = CancellationToken::new();
        sink.start(cancel.clone()).await.expect("sink starts");
        finish(&t, 1);
        finish(&t, 2);

        for _ in 0..100 {
            if t.occupancy().finished == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        sink.stop().await.expect("sink stops");

        let text = std::fs::read_to_string(&path).expect("sink output");
        assert_eq!(text.lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
