use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::transport::{AuthChallenge, ChallengeDisposition, NetworkTask, TaskOutcome};

/// Lifecycle notification emitted by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    DataReceived {
        task: Arc<dyn NetworkTask>,
        data: Bytes,
    },
    BodySent {
        task: Arc<dyn NetworkTask>,
        total_sent: u64,
        total_expected: Option<u64>,
    },
    DownloadProgress {
        task: Arc<dyn NetworkTask>,
        total_written: u64,
        total_expected: Option<u64>,
    },
    /// The file at `location` is deleted by the transport once `ack` fires.
    DownloadFinished {
        task: Arc<dyn NetworkTask>,
        location: PathBuf,
        ack: oneshot::Sender<()>,
    },
    Completed {
        task: Arc<dyn NetworkTask>,
        outcome: TaskOutcome,
    },
    Challenge {
        challenge: AuthChallenge,
        reply: oneshot::Sender<ChallengeDisposition>,
    },
    BackgroundEventsFinished,
    /// Acknowledged once every earlier event has been routed.
    Flush { done: oneshot::Sender<()> },
}

/// Transport-side end of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

/// Coordinator-side end of the event channel.
#[derive(Debug)]
pub struct TransportEvents {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Create the channel that connects a transport to its coordinator.
///
/// Build the transport with the sink, then hand the transport and the
/// receiver to [`crate::SessionCoordinator::new`].
pub fn event_channel() -> (EventSink, TransportEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, TransportEvents { rx })
}

impl EventSink {
    pub fn data_received(&self, task: &Arc<dyn NetworkTask>, data: Bytes) {
        self.send(TransportEvent::DataReceived {
            task: task.clone(),
            data,
        });
    }

    pub fn body_sent(&self, task: &Arc<dyn NetworkTask>, total_sent: u64, total_expected: Option<u64>) {
        self.send(TransportEvent::BodySent {
            task: task.clone(),
            total_sent,
            total_expected,
        });
    }

    pub fn download_progress(
        &self,
        task: &Arc<dyn NetworkTask>,
        total_written: u64,
        total_expected: Option<u64>,
    ) {
        self.send(TransportEvent::DownloadProgress {
            task: task.clone(),
            total_written,
            total_expected,
        });
    }

    /// Hand a finished download to the coordinator and wait until its
    /// handler has run. The caller may delete `location` afterwards.
    pub async fn download_finished(&self, task: &Arc<dyn NetworkTask>, location: PathBuf) {
        let (ack, done) = oneshot::channel();
        if self.send(TransportEvent::DownloadFinished {
            task: task.clone(),
            location,
            ack,
        }) {
            let _ = done.await;
        }
    }

    pub fn completed(&self, task: &Arc<dyn NetworkTask>, outcome: TaskOutcome) {
        self.send(TransportEvent::Completed {
            task: task.clone(),
            outcome,
        });
    }

    /// Ask the coordinator how to answer an authentication challenge.
    pub async fn challenge(&self, challenge: AuthChallenge) -> ChallengeDisposition {
        let (reply, answer) = oneshot::channel();
        if !self.send(TransportEvent::Challenge { challenge, reply }) {
            return ChallengeDisposition::PerformDefaultHandling;
        }
        answer
            .await
            .unwrap_or(ChallengeDisposition::PerformDefaultHandling)
    }

    pub fn background_events_finished(&self) {
        self.send(TransportEvent::BackgroundEventsFinished);
    }

    /// Wait until the coordinator has routed everything sent so far.
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.send(TransportEvent::Flush { done }) {
            let _ = flushed.await;
        }
    }

    fn send(&self, event: TransportEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!("event receiver gone, dropping transport event");
                false
            }
        }
    }
}

impl TransportEvents {
    pub(crate) async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn challenge_defaults_when_receiver_dropped() {
        let (sink, events) = event_channel();
        drop(events);
        let disposition = sink
            .challenge(AuthChallenge {
                host: "api.example".into(),
                method: "server_trust".into(),
                previous_failures: 0,
            })
            .await;
        assert_eq!(disposition, ChallengeDisposition::PerformDefaultHandling);
    }

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (sink, mut events) = event_channel();
        sink.background_events_finished();
        sink.background_events_finished();
        drop(sink);
        let mut count = 0;
        while let Some(event) = events.recv().await {
            assert!(matches!(event, TransportEvent::BackgroundEventsFinished));
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
