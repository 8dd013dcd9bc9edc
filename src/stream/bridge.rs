//! Transcoding relay from raw PCM subscriptions to an encoded HTTP body
//!
//! ```text
//! Subscription<Bytes> --> [feeder task] --> transcoder stdin
//!                                                |
//!                         [relayer task] <-- transcoder stdout
//!                               |
//!                               v
//!                    mpsc<io::Result<Bytes>> --> response body
//! ```
//!
//! Dropping the [`TranscodedStream`] (client disconnect) aborts both tasks;
//! the child is spawned with `kill_on_drop` so it dies with the relayer.

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{StreamConfig, TranscoderConfig};
use crate::error::TranscodeError;
use crate::hub::Subscription;

/// Read size on the transcoder's stdout
const RELAY_CHUNK_SIZE: usize = 4096;

/// Encoded chunks buffered between relayer and HTTP body
const RELAY_QUEUE: usize = 16;

/// Spawns one transcoder per listening client
#[derive(Debug, Clone)]
pub struct StreamBridge {
    transcoder: TranscoderConfig,
    stream: StreamConfig,
}

impl StreamBridge {
    pub fn new(transcoder: TranscoderConfig, stream: StreamConfig) -> Self {
        Self { transcoder, stream }
    }

    pub fn content_type(&self) -> &str {
        &self.transcoder.content_type
    }

    /// Start a transcoder fed by `subscription`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(&self, subscription: Subscription<Bytes>) -> Result<TranscodedStream, TranscodeError> {
        let program = &self.transcoder.program;
        let args = self.transcoder.command_args(&self.stream);

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::SpawnFailed {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or(TranscodeError::PipeUnavailable("stdin"))?;
        let stdout = child.stdout.take().ok_or(TranscodeError::PipeUnavailable("stdout"))?;

        let source = subscription.source().to_string();
        tracing::info!(
            "Spawned transcoder '{}' (pid {:?}) for source '{}'",
            program,
            child.id(),
            source
        );

        let (tx, rx) = mpsc::channel(RELAY_QUEUE);
        let feeder = tokio::spawn(feed(subscription, stdin));
        let relayer = tokio::spawn(relay(child, stdout, tx, source.clone()));

        Ok(TranscodedStream {
            source,
            content_type: self.transcoder.content_type.clone(),
            rx,
            tasks: TaskGuard { feeder, relayer },
        })
    }
}

/// Encoded output of one running transcoder
pub struct TranscodedStream {
    source: String,
    content_type: String,
    rx: mpsc::Receiver<io::Result<Bytes>>,
    tasks: TaskGuard,
}

impl TranscodedStream {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Next encoded chunk; `None` once the transcoder has exited
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.rx.recv().await
    }

    /// Turn into a body stream that tears the transcoder down when dropped
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::unfold(self, |mut transcoded| async move {
            transcoded.next_chunk().await.map(|chunk| (chunk, transcoded))
        })
    }
}

struct TaskGuard {
    feeder: JoinHandle<()>,
    relayer: JoinHandle<()>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.feeder.abort();
        self.relayer.abort();
    }
}

async fn feed(mut subscription: Subscription<Bytes>, mut stdin: ChildStdin) {
    while let Some(chunk) = subscription.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            tracing::debug!("Transcoder input for '{}' closed: {}", subscription.source(), e);
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn relay(
    mut child: Child,
    mut stdout: ChildStdout,
    tx: mpsc::Sender<io::Result<Bytes>>,
    source: String,
) {
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let mut client_gone = false;

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
    drop(tx);

    if client_gone {
        let _ = child.start_kill();
    }

    match child.wait().await {
        Ok(status) if status.success() || client_gone => {
            tracing::debug!("Transcoder for '{}' finished: {}", source, status);
        }
        Ok(status) => {
            tracing::warn!("Transcoder for '{}' exited abnormally: {}", source, status);
        }
        Err(e) => {
            tracing::warn!("Failed to reap transcoder for '{}': {}", source, e);
        }
    }
}
