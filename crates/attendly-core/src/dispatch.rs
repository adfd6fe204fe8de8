//! Asynchronous hand-off from the capture loop to the event sink.
//!
//! A dedicated thread owns the sink and drains a single FIFO queue, so
//! events for one identity reach the sink in the order they were produced.
//! Sink I/O never blocks the producer.

use crate::config::RetryPolicy;
use crate::sink::{DateRange, EventSink, SinkError, SinkEvent};
use crate::types::{AttendanceRecord, IdentityId};
use tokio::sync::{mpsc, oneshot};

type QueryReply = oneshot::Sender<Result<Vec<AttendanceRecord>, SinkError>>;

/// Messages consumed by the sink thread.
enum SinkCommand {
    Apply(SinkEvent),
    Query {
        range: DateRange,
        identity_id: Option<IdentityId>,
        reply: QueryReply,
    },
    Flush(oneshot::Sender<()>),
}

/// Clone-safe handle to the sink thread.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl SinkHandle {
    /// Queue an event for delivery. Never blocks.
    pub fn submit(&self, event: SinkEvent) {
        if let Err(mpsc::error::SendError(SinkCommand::Apply(event))) = self.tx.send(SinkCommand::Apply(event)) {
            tracing::error!(identity = event.identity_id(), ?event, "sink thread gone; event undelivered");
        }
    }

    /// Query from async code. Answered after every event queued before it.
    pub async fn query(
        &self,
        range: DateRange,
        identity_id: Option<IdentityId>,
    ) -> Result<Vec<AttendanceRecord>, SinkError> {
        let reply_rx = self.send_query(range, identity_id)?;
        reply_rx.await.map_err(|_| SinkError::Closed)?
    }

    /// Wait until every event queued before this call has been handled.
    pub async fn flush(&self) -> Result<(), SinkError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx.send(SinkCommand::Flush(reply)).map_err(|_| SinkError::Closed)?;
        reply_rx.await.map_err(|_| SinkError::Closed)
    }

    /// Query from a plain thread. Must not be called inside an async runtime.
    pub fn blocking_query(
        &self,
        range: DateRange,
        identity_id: Option<IdentityId>,
    ) -> Result<Vec<AttendanceRecord>, SinkError> {
        let reply_rx = self.send_query(range, identity_id)?;
        reply_rx.blocking_recv().map_err(|_| SinkError::Closed)?
    }

    fn send_query(
        &self,
        range: DateRange,
        identity_id: Option<IdentityId>,
    ) -> Result<oneshot::Receiver<Result<Vec<AttendanceRecord>, SinkError>>, SinkError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::Query { range, identity_id, reply })
            .map_err(|_| SinkError::Closed)?;
        Ok(reply_rx)
    }
}

/// Spawn the sink thread. It exits once every handle is dropped and the
/// queue is drained; join the returned handle to wait for that.
pub fn spawn_dispatcher(
    mut sink: Box<dyn EventSink>,
    policy: RetryPolicy,
) -> std::io::Result<(SinkHandle, std::thread::JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<SinkCommand>();

    let join = std::thread::Builder::new()
        .name("attendly-sink".into())
        .spawn(move || {
            tracing::info!("sink thread started");
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    SinkCommand::Apply(event) => {
                        deliver(sink.as_mut(), &event, &policy);
                    }
                    SinkCommand::Query { range, identity_id, reply } => {
                        let _ = reply.send(sink.query(range, identity_id.as_deref()));
                    }
                    SinkCommand::Flush(reply) => {
                        let _ = reply.send(());
                    }
                }
            }
            tracing::info!("sink thread exiting");
        })?;

    Ok((SinkHandle { tx }, join))
}

/// Apply one event with bounded retries. Returns false if it was dropped.
fn deliver(sink: &mut dyn EventSink, event: &SinkEvent, policy: &RetryPolicy) -> bool {
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match sink.apply(event) {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(identity = event.identity_id(), attempt, "event delivered after retry");
                }
                return true;
            }
            Err(err) if attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    identity = event.identity_id(),
                    attempt,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "event sink write failed"
                );
                std::thread::sleep(delay);
            }
            Err(err) => {
                tracing::error!(
                    identity = event.identity_id(),
                    attempts = max_attempts,
                    error = %err,
                    ?event,
                    "event undelivered; giving up"
                );
            }
        }
    }
    false
}
