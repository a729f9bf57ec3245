use crate::client::SessionState;
use crate::dispatcher::{Dispatcher, Fault};
use crate::error::{HeosError, Result};
use crate::protocol::Response;
use crate::transport::BoxedStream;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Low-level line-framed connection handler
///
/// Owns the write half of the stream and the background task reading the
/// other half. Inbound lines are decoded and handed to the dispatcher one at
/// a time, in arrival order.
pub(crate) struct Connection {
    writer: Mutex<WriteHalf<BoxedStream>>,
    shutdown: CancellationToken,
    reader: Mutex<Option<JoinHandle<Result<()>>>>,
    finished: watch::Receiver<()>,
}

impl Connection {
    /// Split the stream and spawn the read loop
    pub(crate) fn start(
        stream: BoxedStream,
        dispatcher: Dispatcher,
        state: Arc<watch::Sender<SessionState>>,
        max_line_length: usize,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let shutdown = CancellationToken::new();
        let (finished_tx, finished) = watch::channel(());

        let reader = read_loop(
            BufReader::new(read_half),
            dispatcher,
            shutdown.clone(),
            state,
            max_line_length,
        );
        let handle = tokio::spawn(async move {
            let result = reader.await;
            drop(finished_tx);
            result
        });

        Self {
            writer: Mutex::new(write_half),
            shutdown,
            reader: Mutex::new(Some(handle)),
            finished,
        }
    }

    /// Write one already terminated line
    pub(crate) async fn send_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Wait for the read loop to finish
    ///
    /// Every caller blocks until the loop ends. Only the first caller
    /// observes the loop's result; later ones get `Ok(())`.
    pub(crate) async fn wait(&self) -> Result<()> {
        let handle = self.reader.lock().await.take();
        match handle {
            Some(handle) => handle.await.map_err(|e| HeosError::Io(io::Error::other(e)))?,
            None => {
                // The read task drops the sender when it exits, never sends
                let mut finished = self.finished.clone();
                let _ = finished.changed().await;
                Ok(())
            }
        }
    }

    /// Stop reading and shut down the write half
    pub(crate) async fn close(&self) {
        self.shutdown.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Error shutting down writer: {}", e);
        }
    }

    /// Signal the read loop to stop without waiting
    pub(crate) fn abort(&self) {
        self.shutdown.cancel();
    }
}

/// Longest prefix of an oversized line kept in its fault report
const FAULT_PREVIEW: usize = 128;

/// Outcome of reading one line
enum LineRead {
    Line,
    Oversized,
    Eof,
}

async fn read_loop<R>(
    mut reader: R,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
    max_line_length: usize,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();

    let result = loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::debug!("Read loop stopped by disconnect");
                break Ok(());
            }
            read = read_line_capped(&mut reader, &mut buf, max_line_length) => read,
        };

        match read {
            Ok(LineRead::Eof) => {
                tracing::info!("Connection closed by device");
                break Ok(());
            }
            Ok(LineRead::Line) => {
                handle_line(&dispatcher, &buf).await;
                buf.clear();
            }
            Ok(LineRead::Oversized) => {
                tracing::warn!("Dropping line longer than {} bytes", max_line_length);
                let preview = &buf[..buf.len().min(FAULT_PREVIEW)];
                dispatcher.report(Fault::Decode {
                    line: String::from_utf8_lossy(preview).into_owned(),
                    reason: format!("line exceeds {} bytes", max_line_length),
                });
                buf.clear();
            }
            Err(e) => {
                tracing::error!("Read error: {}", e);
                break Err(e.into());
            }
        }
    };

    state.send_replace(SessionState::Closed);
    result
}

/// Read through the next `\n`, keeping at most `max` bytes of it in `buf`
///
/// The rest of an oversized line is consumed and discarded so the next read
/// starts on a fresh line. A final line without terminator counts as a line.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut oversized = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (oversized, buf.is_empty()) {
                (true, _) => LineRead::Oversized,
                (false, true) => LineRead::Eof,
                (false, false) => LineRead::Line,
            });
        }

        let (used, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        let room = max.saturating_sub(buf.len());
        if used > room {
            oversized = true;
        }
        buf.extend_from_slice(&available[..used.min(room)]);
        reader.consume(used);

        if complete {
            return Ok(if oversized {
                LineRead::Oversized
            } else {
                LineRead::Line
            });
        }
    }
}

/// Decode one line and deliver it; decode failures are reported, not fatal
async fn handle_line(dispatcher: &Dispatcher, raw: &[u8]) {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(e) => {
            tracing::warn!("Dropping line that is not valid UTF-8: {}", e);
            dispatcher.report(Fault::Decode {
                line: String::from_utf8_lossy(raw).into_owned(),
                reason: e.to_string(),
            });
            return;
        }
    };

    if line.is_empty() {
        return;
    }

    tracing::debug!("Received: {}", line);

    match Response::from_line(line) {
        Ok(response) => dispatcher.deliver(response).await,
        Err(e) => {
            tracing::warn!("Failed to decode line: {}", e);
            dispatcher.report(Fault::Decode {
                line: line.to_string(),
                reason: e.to_string(),
            });
        }
    }
}
