//! Byte relay from one conduit source to all of its sinks.
//!
//! ```text
//!   Source ──▶ [chunk buffer] ──┬──▶ Sink #0
//!                               ├──▶ Sink #1
//!                               └──▶ Sink #n
//! ```
//!
//! Endpoints are opened concurrently, each chunk is written to every sink in
//! turn, and end of stream on the source flushes and closes every sink. A sink
//! that stops accepting data fails the whole relay.
use std::{io, path::PathBuf, time::Duration};

use futures_util::future::{try_join, try_join_all};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    config::DEFAULT_CHUNK_SIZE,
    error::{RelayError, RelayStage},
};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bounds of the back-off between attempts to open a FIFO sink.
const SINK_RETRY_MIN: Duration = Duration::from_millis(1);
const SINK_RETRY_MAX: Duration = Duration::from_millis(50);

/// Readable end of a conduit.
pub enum Source {
    /// FIFO the producer writes into.
    Fifo(PathBuf),
    /// Stream handed over by the producing process once its child is spawned.
    Handoff(oneshot::Receiver<BoxReader>),
    /// Already open stream.
    Stream(BoxReader),
}

impl Source {
    /// Open a FIFO source right away, leaving other variants untouched.
    ///
    /// The read end is opened without blocking, so the FIFO has a reader before
    /// the producer starts and `read` waits for the first writer.
    pub fn listen(self) -> io::Result<Self> {
        match self {
            Source::Fifo(path) => Ok(Source::Stream(open_fifo_reader(&path)?)),
            other => Ok(other),
        }
    }

    async fn open(self) -> io::Result<BoxReader> {
        match self {
            Source::Fifo(path) => open_fifo_reader(&path),
            Source::Handoff(rx) => rx.await.map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "producer stream was never handed over")
            }),
            Source::Stream(reader) => Ok(reader),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn open_fifo_reader(path: &std::path::Path) -> io::Result<BoxReader> {
            let rx = tokio::net::unix::pipe::OpenOptions::new().open_receiver(path)?;
            Ok(Box::new(rx))
        }

        /// `Ok(None)` while the FIFO has no reader yet.
        fn try_open_fifo_writer(path: &std::path::Path) -> io::Result<Option<BoxWriter>> {
            match tokio::net::unix::pipe::OpenOptions::new().open_sender(path) {
                Ok(tx) => Ok(Some(Box::new(tx))),
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => Ok(None),
                Err(e) => Err(e),
            }
        }
    } else {
        fn open_fifo_reader(path: &std::path::Path) -> io::Result<BoxReader> {
            let file = std::fs::File::open(path)?;
            Ok(Box::new(tokio::fs::File::from_std(file)))
        }

        fn try_open_fifo_writer(path: &std::path::Path) -> io::Result<Option<BoxWriter>> {
            let file = std::fs::OpenOptions::new().write(true).open(path)?;
            Ok(Some(Box::new(tokio::fs::File::from_std(file))))
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Fifo(path) => f.debug_tuple("Fifo").field(path).finish(),
            Source::Handoff(_) => f.write_str("Handoff"),
            Source::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Writable end of a conduit, one per consumer.
pub enum Sink {
    /// FIFO the consumer reads from.
    ///
    /// Opening waits for the consumer to open its end and fails once
    /// `consumer_exited` fires without that having happened.
    Fifo {
        path: PathBuf,
        consumer_exited: CancellationToken,
    },
    /// Stream handed over by the consuming process once its child is spawned.
    Handoff(oneshot::Receiver<BoxWriter>),
    /// Already open stream.
    Stream(BoxWriter),
}

impl Sink {
    /// FIFO sink whose consumer is tracked by `consumer_exited`.
    pub fn fifo(path: impl Into<PathBuf>, consumer_exited: CancellationToken) -> Self {
        Sink::Fifo {
            path: path.into(),
            consumer_exited,
        }
    }

    async fn open(self) -> io::Result<BoxWriter> {
        match self {
            Sink::Fifo {
                path,
                consumer_exited,
            } => {
                let mut backoff = SINK_RETRY_MIN;
                loop {
                    if let Some(writer) = try_open_fifo_writer(&path)? {
                        return Ok(writer);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = consumer_exited.cancelled() => {
                            return Err(io::Error::new(
                                io::ErrorKind::BrokenPipe,
                                "consumer exited without opening its input",
                            ));
                        }
                    }
                    backoff = (backoff * 2).min(SINK_RETRY_MAX);
                }
            }
            Sink::Handoff(rx) => rx.await.map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "consumer stream was never handed over")
            }),
            Sink::Stream(writer) => Ok(writer),
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sink::Fifo { path, .. } => f.debug_tuple("Fifo").field(path).finish(),
            Sink::Handoff(_) => f.write_str("Handoff"),
            Sink::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from the source (each sink received all of them).
    pub bytes: u64,
    pub sinks: usize,
}

#[derive(Debug)]
pub struct Relay {
    conduit: String,
    source: Source,
    sinks: Vec<Sink>,
    chunk_size: usize,
}

impl Relay {
    pub fn new(conduit: impl Into<String>, source: Source) -> Self {
        Self {
            conduit: conduit.into(),
            source,
            sinks: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_sink(mut self, sink: Sink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Sink) {
        self.sinks.push(sink);
    }

    pub fn conduit(&self) -> &str {
        &self.conduit
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Open the source now if it is a FIFO; see [`Source::listen`].
    pub fn listen(mut self) -> Result<Self, RelayError> {
        self.source = self
            .source
            .listen()
            .map_err(|e| RelayError::new(self.conduit.as_str(), RelayStage::Open, e))?;
        Ok(self)
    }

    /// Copy the source to every sink until end of stream.
    pub async fn run(self) -> Result<RelayStats, RelayError> {
        let Relay {
            conduit,
            source,
            sinks,
            chunk_size,
        } = self;
        let fail = |stage: RelayStage| {
            let conduit = conduit.as_str();
            move |e: io::Error| RelayError::new(conduit, stage, e)
        };

        let sink_count = sinks.len();
        trace!(target: "plumb.exec.relay", %conduit, sinks = sink_count, "opening endpoints");
        let (mut reader, mut writers) =
            try_join(source.open(), try_join_all(sinks.into_iter().map(Sink::open)))
                .await
                .map_err(fail(RelayStage::Open))?;

        let mut buf = vec![0u8; chunk_size];
        let mut bytes = 0u64;
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(fail(RelayStage::Read)(e)),
            };
            for writer in writers.iter_mut() {
                writer
                    .write_all(&buf[..n])
                    .await
                    .map_err(fail(RelayStage::Write))?;
            }
            bytes += n as u64;
        }

        for writer in writers.iter_mut() {
            writer.flush().await.map_err(fail(RelayStage::Write))?;
            writer.shutdown().await.map_err(fail(RelayStage::Write))?;
        }

        debug!(target: "plumb.exec.relay", %conduit, bytes, sinks = sink_count, "end of stream");
        Ok(RelayStats {
            bytes,
            sinks: sink_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn feed(data: Vec<u8>) -> Source {
        let (mut tx, rx) = duplex(64);
        tokio::spawn(async move {
            // the relay may bail out early; dropping tx signals end of stream
            let _ = tx.write_all(&data).await;
        });
        Source::Stream(Box::new(rx))
    }

    fn collect() -> (Sink, tokio::task::JoinHandle<Vec<u8>>) {
        let (tx, mut rx) = duplex(64);
        let handle = tokio::spawn(async move {
            let mut out = Vec::new();
            rx.read_to_end(&mut out).await.unwrap();
            out
        });
        (Sink::Stream(Box::new(tx)), handle)
    }

    #[tokio::test]
    async fn delivers_all_bytes_in_order() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let (sink, out) = collect();

        let stats = Relay::new("p", feed(data.clone()))
            .with_chunk_size(7)
            .with_sink(sink)
            .run()
            .await
            .unwrap();

        assert_eq!(stats, RelayStats { bytes: 10_000, sinks: 1 });
        assert_eq!(out.await.unwrap(), data);
    }

    #[tokio::test]
    async fn fan_out_gives_every_sink_a_full_copy() {
        let data = b"the quick brown fox jumps over the lazy dog\n".repeat(200);
        let mut relay = Relay::new("fan", feed(data.clone())).with_chunk_size(13);
        let mut outputs = Vec::new();
        for _ in 0..3 {
            let (sink, out) = collect();
            relay.add_sink(sink);
            outputs.push(out);
        }
        assert_eq!(relay.sink_count(), 3);

        relay.run().await.unwrap();
        for out in outputs {
            assert_eq!(out.await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn without_sinks_drains_the_source() {
        let stats = Relay::new("void", feed(vec![1u8; 1000])).run().await.unwrap();
        assert_eq!(stats, RelayStats { bytes: 1000, sinks: 0 });
    }

    #[tokio::test]
    async fn empty_source_closes_sinks() {
        let (sink, out) = collect();
        let stats = Relay::new("empty", feed(Vec::new()))
            .with_sink(sink)
            .run()
            .await
            .unwrap();
        assert_eq!(stats.bytes, 0);
        assert!(out.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handoff_source_waits_for_stream() {
        let (tx, rx) = oneshot::channel::<BoxReader>();
        let (sink, out) = collect();
        let relay = tokio::spawn(Relay::new("late", Source::Handoff(rx)).with_sink(sink).run());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let (mut w, r) = duplex(16);
        tx.send(Box::new(r)).ok().unwrap();
        w.write_all(b"late data").await.unwrap();
        drop(w);

        relay.await.unwrap().unwrap();
        assert_eq!(out.await.unwrap(), b"late data");
    }

    #[tokio::test]
    async fn dropped_handoff_fails_to_open() {
        let (tx, rx) = oneshot::channel::<BoxWriter>();
        drop(tx);

        let err = Relay::new("orphan", feed(b"x".to_vec()))
            .with_sink(Sink::Handoff(rx))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.stage, RelayStage::Open);
        assert_eq!(err.conduit, "orphan");
    }

    #[tokio::test]
    async fn closed_sink_is_a_write_error() {
        let (tx, rx) = duplex(8);
        drop(rx);

        let err = Relay::new("broken", feed(vec![0u8; 256]))
            .with_sink(Sink::Stream(Box::new(tx)))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.stage, RelayStage::Write);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fifo_endpoints() {
        use crate::{config::ExecConfig, conduit::FifoDir};

        let parent = tempfile::tempdir().unwrap();
        let mut fifos = FifoDir::create(&ExecConfig::default().with_fifo_dir(parent.path())).unwrap();
        let src = fifos.allocate("f", "out").unwrap();
        let dst = fifos.allocate("f", "in").unwrap();

        let relay = tokio::spawn(
            Relay::new("f", Source::Fifo(src.clone()))
                .with_sink(Sink::fifo(&dst, CancellationToken::new()))
                .run(),
        );
        let producer = tokio::spawn(async move {
            let mut f = tokio::fs::OpenOptions::new().write(true).open(&src).await.unwrap();
            f.write_all(b"hello").await.unwrap();
            f.flush().await.unwrap();
        });
        let mut received = Vec::new();
        let mut f = tokio::fs::File::open(&dst).await.unwrap();
        f.read_to_end(&mut received).await.unwrap();

        producer.await.unwrap();
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(received, b"hello");
        assert_eq!(stats.bytes, 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn listening_fifo_ends_when_released_without_writer() {
        use crate::{
            config::ExecConfig,
            conduit::{FifoDir, release_fifo},
        };

        let parent = tempfile::tempdir().unwrap();
        let mut fifos = FifoDir::create(&ExecConfig::default().with_fifo_dir(parent.path())).unwrap();
        let src = fifos.allocate("silent", "out").unwrap();

        let relay = Relay::new("silent", Source::Fifo(src.clone())).listen().unwrap();
        release_fifo(&src);

        let stats = tokio::time::timeout(std::time::Duration::from_secs(5), relay.run())
            .await
            .expect("relay stayed blocked")
            .unwrap();
        assert_eq!(stats.bytes, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fifo_sink_gives_up_when_consumer_exits_unopened() {
        use crate::{config::ExecConfig, conduit::FifoDir};

        let parent = tempfile::tempdir().unwrap();
        let mut fifos = FifoDir::create(&ExecConfig::default().with_fifo_dir(parent.path())).unwrap();
        let dst = fifos.allocate("lost", "in").unwrap();

        // the consumer is already gone before the relay gets to open its sink
        let exited = CancellationToken::new();
        exited.cancel();
        let run = Relay::new("lost", feed(vec![0u8; 200_000]))
            .with_sink(Sink::fifo(&dst, exited))
            .run();

        let err = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .expect("sink open stayed blocked")
            .unwrap_err();
        assert_eq!(err.stage, RelayStage::Open);
        assert_eq!(err.source.kind(), io::ErrorKind::BrokenPipe);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fifo_sink_waits_for_a_late_consumer() {
        use crate::{config::ExecConfig, conduit::FifoDir};

        let parent = tempfile::tempdir().unwrap();
        let mut fifos = FifoDir::create(&ExecConfig::default().with_fifo_dir(parent.path())).unwrap();
        let dst = fifos.allocate("late", "in").unwrap();

        let relay = tokio::spawn(
            Relay::new("late", feed(b"patience".to_vec()))
                .with_sink(Sink::fifo(&dst, CancellationToken::new()))
                .run(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut rx = tokio::net::unix::pipe::OpenOptions::new().open_receiver(&dst).unwrap();
        let mut received = Vec::new();
        rx.read_to_end(&mut received).await.unwrap();

        relay.await.unwrap().unwrap();
        assert_eq!(received, b"patience");
    }

    #[test]
    fn listen_on_missing_fifo_is_an_open_error() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = rt.enter();
        let err = Relay::new("gone", Source::Fifo(PathBuf::from("/nonexistent/plumb/fifo")))
            .listen()
            .unwrap_err();
        assert_eq!(err.stage, RelayStage::Open);
    }
}
