//! Newline framing over raw byte streams.

use std::sync::Arc;

use busadapter_core::{LogLevel, Logger};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::STREAM_CAPACITY;

/// Read `source` line by line into a new stream.
///
/// A trailing chunk without a newline is still emitted when the source ends.
/// A read error is logged and ends this stream only. If the consumer drops
/// the stream the source is still drained so the writer never blocks on a
/// full pipe.
pub(crate) fn spawn_line_reader<R>(
    source: R,
    name: &'static str,
    logger: Arc<dyn Logger>,
) -> mpsc::Receiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
    tokio::spawn(async move {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        let mut consumer_alive = true;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    if consumer_alive && tx.send(line).await.is_err() {
                        debug!(stream = name, "line consumer gone, draining");
                        consumer_alive = false;
                    }
                }
                Err(e) => {
                    logger.log(LogLevel::Error, &format!("can't read from {name}: {e}"));
                    break;
                }
            }
        }
        debug!(stream = name, "line reader finished");
    });
    rx
}

/// Write every item of `input` to `sink` followed by a newline.
///
/// A failed write is logged with the line that was being written; later
/// lines are still attempted. The sink is dropped, closing it, once `input`
/// ends.
pub(crate) fn spawn_line_writer<W>(
    sink: W,
    mut input: mpsc::Receiver<String>,
    logger: Arc<dyn Logger>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut sink = sink;
        while let Some(line) = input.recv().await {
            let mut framed = Vec::with_capacity(line.len() + 1);
            framed.extend_from_slice(line.as_bytes());
            framed.push(b'\n');

            let written = match sink.write_all(&framed).await {
                Ok(()) => sink.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                logger.log(LogLevel::Error, &format!("{line}: {e}"));
            }
        }
        debug!("line writer finished");
    })
}
