//! Bounded outbound queue between the capture loops and the session.
//!
//! Producers (the audio window loop, the snapshot loop) call `submit`, which
//! never blocks: when the queue is full the payload is discarded and a
//! `Dropped` result is published. A single forwarder task owns the receiving
//! end and sends payloads on the session in submission order, publishing a
//! `SendResultEvent` for each.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::diagnostics::SessionDiagnostics;
use super::transport::{LiveSession, RealtimeInput};
use crate::error::{ParleyError, Result};
use crate::ipc::events::{SendOutcome, SendResultEvent};

struct Outbound {
    seq: u64,
    input: RealtimeInput,
}

/// Producer side; cheap to clone.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Outbound>,
    seq: Arc<AtomicU64>,
    results: broadcast::Sender<SendResultEvent>,
    diagnostics: Arc<SessionDiagnostics>,
}

pub struct OutboundReceiver {
    rx: mpsc::Receiver<Outbound>,
}

impl OutboundReceiver {
    /// Take the next queued payload without waiting.
    pub fn try_recv(&mut self) -> Option<RealtimeInput> {
        self.rx.try_recv().ok().map(|o| o.input)
    }
}

impl OutboundQueue {
    pub fn channel(
        capacity: usize,
        results: broadcast::Sender<SendResultEvent>,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                seq: Arc::new(AtomicU64::new(0)),
                results,
                diagnostics,
            },
            OutboundReceiver { rx },
        )
    }

    /// Queue a payload without waiting. Returns its sequence number.
    ///
    /// # Errors
    /// `OutboundQueueFull` when the forwarder is behind (the payload is
    /// dropped and reported), `NotConnected` once the forwarder has stopped.
    pub fn submit(&self, input: RealtimeInput) -> Result<u64> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let kind = input.kind;
        match self.tx.try_send(Outbound { seq, input }) {
            Ok(()) => Ok(seq),
            Err(mpsc::error::TrySendError::Full(_)) => {
                SessionDiagnostics::bump(&self.diagnostics.sends_dropped);
                warn!(seq, ?kind, "outbound queue full, payload dropped");
                let _ = self.results.send(SendResultEvent {
                    seq,
                    kind,
                    outcome: SendOutcome::Dropped,
                });
                Err(ParleyError::OutboundQueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ParleyError::NotConnected),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Send every queued payload on `session` until all producers are gone or
/// the task is aborted.
pub async fn forward(
    mut receiver: OutboundReceiver,
    session: Arc<dyn LiveSession>,
    results: broadcast::Sender<SendResultEvent>,
    diagnostics: Arc<SessionDiagnostics>,
) {
    debug!("outbound forwarder started");
    while let Some(Outbound { seq, input }) = receiver.rx.recv().await {
        let kind = input.kind;
        let outcome = match session.send(input).await {
            Ok(()) => {
                SessionDiagnostics::bump(&diagnostics.sends_ok);
                SendOutcome::Sent
            }
            Err(e) => {
                SessionDiagnostics::bump(&diagnostics.sends_failed);
                warn!(seq, ?kind, "send failed: {e}");
                SendOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        let _ = results.send(SendResultEvent { seq, kind, outcome });
    }
    info!("outbound forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MediaBlob;
    use crate::ipc::events::MediaKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSession {
        sent: Mutex<Vec<RealtimeInput>>,
        fail: bool,
    }

    #[async_trait]
    impl LiveSession for RecordingSession {
        async fn send(&self, input: RealtimeInput) -> Result<()> {
            if self.fail {
                return Err(ParleyError::Remote("socket closed".into()));
            }
            self.sent.lock().push(input);
            Ok(())
        }
        async fn close(&self) {}
    }

    fn audio(tag: &str) -> RealtimeInput {
        RealtimeInput::audio(MediaBlob::new("audio/pcm;rate=16000", tag))
    }

    #[test]
    fn full_queue_drops_and_reports() {
        let (results, mut results_rx) = broadcast::channel(8);
        let diag = Arc::new(SessionDiagnostics::default());
        let (queue, _rx) = OutboundQueue::channel(1, results, Arc::clone(&diag));

        assert_eq!(queue.submit(audio("a")).unwrap(), 0);
        let err = queue.submit(audio("b")).unwrap_err();
        assert!(matches!(err, ParleyError::OutboundQueueFull));

        let ev = results_rx.try_recv().unwrap();
        assert_eq!(ev.seq, 1);
        assert_eq!(ev.outcome, SendOutcome::Dropped);
        assert_eq!(diag.snapshot().sends_dropped, 1);
    }

    #[test]
    fn submit_after_forwarder_gone_is_not_connected() {
        let (results, _) = broadcast::channel(8);
        let (queue, rx) =
            OutboundQueue::channel(4, results, Arc::new(SessionDiagnostics::default()));
        drop(rx);
        assert!(queue.is_closed());
        assert!(matches!(
            queue.submit(audio("x")),
            Err(ParleyError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn forwarder_preserves_order_and_reports_each_send() {
        let (results, mut results_rx) = broadcast::channel(16);
        let diag = Arc::new(SessionDiagnostics::default());
        let (queue, rx) = OutboundQueue::channel(8, results.clone(), Arc::clone(&diag));
        let session = Arc::new(RecordingSession::default());

        for tag in ["1", "2", "3"] {
            queue.submit(audio(tag)).unwrap();
        }
        queue
            .submit(RealtimeInput::image(MediaBlob::new("image/jpeg", "4")))
            .unwrap();
        drop(queue);

        forward(rx, session.clone(), results, Arc::clone(&diag)).await;

        let sent: Vec<_> = session.sent.lock().iter().map(|i| i.blob.data.clone()).collect();
        assert_eq!(sent, vec!["1", "2", "3", "4"]);
        let mut outcomes = Vec::new();
        while let Ok(ev) = results_rx.try_recv() {
            outcomes.push((ev.seq, ev.kind, ev.outcome));
        }
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[3], (3, MediaKind::Image, SendOutcome::Sent));
        assert_eq!(diag.snapshot().sends_ok, 4);
    }

    #[tokio::test]
    async fn failed_sends_are_reported_not_fatal() {
        let (results, mut results_rx) = broadcast::channel(16);
        let diag = Arc::new(SessionDiagnostics::default());
        let (queue, rx) = OutboundQueue::channel(8, results.clone(), Arc::clone(&diag));
        let session = Arc::new(RecordingSession {
            fail: true,
            ..Default::default()
        });
        queue.submit(audio("a")).unwrap();
        queue.submit(audio("b")).unwrap();
        drop(queue);

        forward(rx, session, results, Arc::clone(&diag)).await;

        let first = results_rx.try_recv().unwrap();
        assert!(matches!(first.outcome, SendOutcome::Failed { .. }));
        assert_eq!(diag.snapshot().sends_failed, 2);
    }
}
