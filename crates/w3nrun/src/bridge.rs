//! # Sink Bridge
//!
//! Turns a stream of `(bytes | none, error?)` notifications into writes on a
//! byte sink.
//!
//! - Each chunk is written at the offset right after the previous one.
//! - A `none` notification finalizes the sink, with its error if one is
//!   given. The sink is finalized exactly once, also when the producer goes
//!   away without finalizing.
//! - The bridge's `Valve` is engaged while a chunk is being written, so a
//!   producer that waits on `push` never runs ahead of the sink.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use w3nrpc::FailureReason;

use crate::caps::sink::ByteSinkView;
use crate::valve::Valve;

enum Notice {
    Chunk(Vec<u8>),
    Done(Option<FailureReason>),
}

pub struct SinkBridge {
    tx: mpsc::UnboundedSender<Notice>,
    valve: Valve,
    writer: JoinHandle<Result<u64, FailureReason>>,
}

impl SinkBridge {
    pub fn new(sink: ByteSinkView) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let valve = Valve::new();
        let writer = tokio::spawn(drain(sink, valve.clone(), rx));
        Self { tx, valve, writer }
    }

    pub fn valve(&self) -> &Valve {
        &self.valve
    }

    /// Feeds one notification once the sink is ready for it.
    ///
    /// `Some(bytes)` is written. `None` finalizes the sink with `err`.
    /// Fails if an earlier write failed or the sink was already finalized.
    pub async fn push(&self, bytes: Option<Vec<u8>>, err: Option<FailureReason>) -> Result<(), FailureReason> {
        self.valve.wait().await?;
        let finalized = || FailureReason::Handler("sink is already finalized".into());
        match bytes {
            Some(bytes) => {
                self.valve.engage();
                self.tx.send(Notice::Chunk(bytes)).map_err(|_| finalized())
            }
            None => {
                let sent = self.tx.send(Notice::Done(err)).map_err(|_| finalized());
                // Later pushes fail without waiting for the writer to catch up.
                self.valve.poison(finalized());
                sent
            }
        }
    }

    /// Waits for the writer. Returns the number of bytes written.
    ///
    /// If `push(None, ..)` was never called the sink is finalized with an
    /// error here.
    pub async fn finish(self) -> Result<u64, FailureReason> {
        drop(self.tx);
        match self.writer.await {
            Ok(result) => result,
            Err(e) => Err(FailureReason::Handler(format!("sink writer failed: {}", e))),
        }
    }
}

async fn drain(sink: ByteSinkView, valve: Valve, mut rx: mpsc::UnboundedReceiver<Notice>) -> Result<u64, FailureReason> {
    let mut offset = 0u64;

    while let Some(notice) = rx.recv().await {
        match notice {
            Notice::Chunk(bytes) => {
                if let Err(e) = sink.write_at(offset, &bytes).await {
                    let reason = e.into_failure();
                    tracing::debug!(offset, error = %reason, "sink write failed");
                    valve.poison(reason.clone());
                    finalize(&sink, Some(&reason)).await;
                    return Err(reason);
                }
                offset += bytes.len() as u64;
                valve.disengage();
            }
            Notice::Done(err) => {
                finalize(&sink, err.as_ref()).await;
                valve.poison(FailureReason::Handler("sink is already finalized".into()));
                return match err {
                    Some(reason) => Err(reason),
                    None => Ok(offset),
                };
            }
        }
    }

    let reason = FailureReason::Handler("producer went away before finishing".into());
    finalize(&sink, Some(&reason)).await;
    Err(reason)
}

async fn finalize(sink: &ByteSinkView, err: Option<&FailureReason>) {
    let msg = err.map(ToString::to_string);
    if let Err(e) = sink.done(msg.as_deref()).await {
        tracing::debug!(error = %e, "sink refused to finalize");
    }
}
