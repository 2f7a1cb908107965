//! Per-run background tasks: output readers, exit waiter, frame capture and
//! stop escalation.

use super::Inner;
use crate::browser::BrowserTab;
use crate::model::{AgentExit, LogChannel, RunId, TestId};
use crate::process::{OutputStream, ProcessSignaller, StopSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_BUFFER: usize = 8192;

/// Decoded output ready for the run table.
#[derive(Debug, PartialEq, Eq)]
pub(super) struct Decoded {
    /// Text as it arrived, for the log buffers.
    pub text: String,
    /// Complete lines available for parsing, if any.
    pub lines: Option<String>,
}

/// Turns raw reads into UTF-8 text and complete lines.
///
/// A multi-byte character split across reads is held back until its tail
/// arrives. A line without its newline is held back from parsing so a
/// marker split across reads is still recognised.
#[derive(Debug, Default)]
pub(super) struct ChunkDecoder {
    bytes: Vec<u8>,
    partial: String,
}

impl ChunkDecoder {
    pub(super) fn push(&mut self, data: &[u8]) -> Option<Decoded> {
        self.bytes.extend_from_slice(data);
        let text = match std::str::from_utf8(&self.bytes) {
            Ok(text) => {
                let text = text.to_string();
                self.bytes.clear();
                text
            }
            Err(err) if err.error_len().is_none() => {
                let tail = self.bytes.split_off(err.valid_up_to());
                let head = std::mem::replace(&mut self.bytes, tail);
                String::from_utf8_lossy(&head).into_owned()
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.bytes).into_owned();
                self.bytes.clear();
                text
            }
        };
        if text.is_empty() {
            return None;
        }
        self.partial.push_str(&text);
        let lines = self.partial.rfind('\n').map(|newline| {
            let rest = self.partial.split_off(newline + 1);
            std::mem::replace(&mut self.partial, rest)
        });
        Some(Decoded { text, lines })
    }

    /// Flush whatever is left at end of stream.
    pub(super) fn finish(&mut self) -> Option<Decoded> {
        let text = String::from_utf8_lossy(&self.bytes).into_owned();
        self.bytes.clear();
        self.partial.push_str(&text);
        let lines = std::mem::take(&mut self.partial);
        if text.is_empty() && lines.is_empty() {
            return None;
        }
        Some(Decoded {
            text,
            lines: (!lines.is_empty()).then_some(lines),
        })
    }
}

pub(super) async fn pump_output(
    inner: Arc<Inner>,
    test_id: TestId,
    run_id: RunId,
    channel: LogChannel,
    mut reader: OutputStream,
) {
    let mut decoder = ChunkDecoder::default();
    let mut buf = vec![0_u8; READ_BUFFER];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => {
                if let Some(decoded) = buf.get(..read).and_then(|data| decoder.push(data)) {
                    inner.handle_output(&test_id, run_id, channel, decoded);
                }
            }
            Err(err) => {
                warn!(test_id = %test_id, ?channel, error = %err, "agent output read failed");
                break;
            }
        }
    }
    if let Some(decoded) = decoder.finish() {
        inner.handle_output(&test_id, run_id, channel, decoded);
    }
    debug!(test_id = %test_id, ?channel, "agent output closed");
}

/// Wait for the process, let the readers drain, then conclude the run.
pub(super) async fn await_exit(
    inner: Arc<Inner>,
    test_id: TestId,
    run_id: RunId,
    exit: oneshot::Receiver<AgentExit>,
    exited: CancellationToken,
    readers: Vec<JoinHandle<()>>,
) {
    let exit = exit.await.unwrap_or_else(|_| AgentExit::Lost {
        message: "agent exit status was never reported".to_string(),
    });
    exited.cancel();

    let deadline = tokio::time::Instant::now() + inner.config.drain_timeout();
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            warn!(test_id = %test_id, "agent output did not drain in time");
            reader.abort();
        }
    }
    inner.handle_exit(&test_id, run_id, &exit);
}

pub(super) async fn capture_frames(
    inner: Arc<Inner>,
    test_id: TestId,
    run_id: RunId,
    tab: Arc<dyn BrowserTab>,
    cancel: CancellationToken,
) {
    let mut stream = match inner.capture.start(Arc::clone(&tab)).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(test_id = %test_id, error = %err, "frame capture unavailable");
            return;
        }
    };
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = stream.next_frame() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        inner.handle_frame(&test_id, run_id, frame.data.clone(), tab.current_url());
        if let Err(err) = stream.ack(&frame).await {
            debug!(test_id = %test_id, error = %err, "frame ack failed");
        }
    }
    if let Err(err) = stream.stop().await {
        debug!(test_id = %test_id, error = %err, "failed to stop frame capture");
    }
}

/// SIGKILL after `grace` unless the process exits first.
pub(super) async fn escalate_stop(
    test_id: TestId,
    signaller: Arc<dyn ProcessSignaller>,
    exited: CancellationToken,
    grace: Duration,
) {
    tokio::select! {
        () = exited.cancelled() => {}
        () = tokio::time::sleep(grace) => {
            warn!(test_id = %test_id, "agent ignored SIGTERM, killing");
            if let Err(err) = signaller.signal(StopSignal::Kill) {
                warn!(test_id = %test_id, error = %err, "failed to kill agent");
            }
        }
    }
}
