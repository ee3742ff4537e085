//! Outbound message bookkeeping: the pending-ack queue awaiting server
//! confirmation, and the backlog of publishes queued while disconnected.
//!
//! Both queues are owned exclusively by the connection dispatcher task.

use crate::error::{codes, ErrorInfo};
use crate::protocol::ProtocolMessage;

/// Completion handle for one outbound frame. `None` is success; dropping the
/// receiving side orphans the entry, whose eventual completion is discarded.
pub(crate) type Completion = tokio::sync::oneshot::Sender<Option<ErrorInfo>>;

fn complete(completion: Option<Completion>, result: Option<ErrorInfo>) {
    if let Some(completion) = completion {
        // A failed send means the caller went away; nothing to deliver to.
        let _ = completion.send(result);
    }
}

pub(crate) fn serial_skipped_error() -> ErrorInfo {
    ErrorInfo::new(
        codes::INTERNAL_ERROR,
        "serial for message was skipped by acknowledgement",
    )
}

/// Frames sent and awaiting ACK/NACK, ordered by ascending `msgSerial` with
/// at most one entry per serial.
#[derive(Default)]
pub(crate) struct PendingQueue {
    queue: Vec<(i64, Option<Completion>)>,
}

impl PendingQueue {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn enqueue(&mut self, serial: i64, completion: Option<Completion>) {
        let i = self.queue.partition_point(|(s, _)| *s < serial);
        if self.queue.get(i).is_some_and(|(s, _)| *s == serial) {
            tracing::warn!(serial, "duplicated message serial, dropping completion");
            return;
        }
        self.queue.insert(i, (serial, completion));
    }

    /// Positive confirmation of `[serial, serial+count)`. Entries below
    /// `serial` were skipped by the server and fail with a distinguished
    /// error; entries in range complete with `error` (success when `None`).
    pub fn ack(&mut self, serial: i64, count: i64, error: Option<ErrorInfo>) {
        let skip_error = error.clone().unwrap_or_else(serial_skipped_error);
        let end = serial.saturating_add(count.max(0));
        while let Some((s, _)) = self.queue.first() {
            let s = *s;
            if s < serial {
                tracing::debug!(serial = s, "NACK for skipped message serial");
                let (_, completion) = self.queue.remove(0);
                complete(completion, Some(skip_error.clone()));
            } else if s < end {
                tracing::trace!(serial = s, "ACK for message serial");
                let (_, completion) = self.queue.remove(0);
                complete(completion, error.clone());
            } else {
                break;
            }
        }
    }

    /// Negative confirmation of `[serial, serial+count)`: entries in range
    /// fail with `error`; entries below `serial` were skipped by the server
    /// and fail with the distinguished skip error.
    pub fn nack(&mut self, serial: i64, count: i64, error: ErrorInfo) {
        let skip_error = serial_skipped_error();
        let end = serial.saturating_add(count.max(0));
        while let Some((s, _)) = self.queue.first() {
            let s = *s;
            if s >= end {
                break;
            }
            tracing::debug!(serial = s, "NACK for message serial");
            let (_, completion) = self.queue.remove(0);
            let err = if s < serial { skip_error.clone() } else { error.clone() };
            complete(completion, Some(err));
        }
    }

    /// Fail every remaining entry, e.g. when the connection dies beyond
    /// resumability.
    pub fn fail_all(&mut self, error: ErrorInfo) {
        for (serial, completion) in self.queue.drain(..) {
            tracing::debug!(serial, "failing pending message: {error}");
            complete(completion, Some(error.clone()));
        }
    }
}

/// Publishes accepted while the connection couldn't transmit, preserved in
/// submission order until the next CONNECTED (drained) or a terminal state
/// (failed).
#[derive(Default)]
pub(crate) struct OutboundQueue {
    queue: Vec<(ProtocolMessage, Option<Completion>)>,
}

impl OutboundQueue {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn enqueue(&mut self, msg: ProtocolMessage, completion: Option<Completion>) {
        self.queue.push((msg, completion));
    }

    pub fn drain(&mut self) -> Vec<(ProtocolMessage, Option<Completion>)> {
        std::mem::take(&mut self.queue)
    }

    pub fn fail_all(&mut self, error: ErrorInfo) {
        for (msg, completion) in self.queue.drain(..) {
            tracing::debug!(action = msg.action, "failing queued message: {error}");
            complete(
                completion,
                Some(ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, error.message.clone())),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::action;
    use tokio::sync::oneshot;

    fn entry() -> (Completion, oneshot::Receiver<Option<ErrorInfo>>) {
        oneshot::channel()
    }

    fn outcome(rx: &mut oneshot::Receiver<Option<ErrorInfo>>) -> Option<Option<ErrorInfo>> {
        rx.try_recv().ok()
    }

    #[test]
    fn ack_completes_range_in_order() {
        let mut q = PendingQueue::default();
        let mut rxs = Vec::new();
        for serial in 0..3 {
            let (tx, rx) = entry();
            q.enqueue(serial, Some(tx));
            rxs.push(rx);
        }

        q.ack(0, 2, None);
        assert_eq!(outcome(&mut rxs[0]), Some(None));
        assert_eq!(outcome(&mut rxs[1]), Some(None));
        assert_eq!(outcome(&mut rxs[2]), None);
        assert_eq!(q.len(), 1);

        q.ack(2, 1, None);
        assert_eq!(outcome(&mut rxs[2]), Some(None));
        assert!(q.is_empty());
    }

    #[test]
    fn ack_carrying_error_fails_the_range() {
        let mut q = PendingQueue::default();
        let (tx, mut rx) = entry();
        q.enqueue(0, Some(tx));
        let err = ErrorInfo::new(50000, "rejected");
        q.ack(0, 1, Some(err.clone()));
        assert_eq!(outcome(&mut rx), Some(Some(err)));
    }

    #[test]
    fn skipped_serials_fail_with_skip_error() {
        // ACK serials [0..2], then NACK serial 5: serials 3 and 4 were
        // skipped by the server and fail accordingly.
        let mut q = PendingQueue::default();
        let mut rxs = Vec::new();
        for serial in 0..6 {
            let (tx, rx) = entry();
            q.enqueue(serial, Some(tx));
            rxs.push(rx);
        }

        q.ack(0, 3, None);
        for rx in &mut rxs[..3] {
            assert_eq!(outcome(rx), Some(None));
        }

        let nack_err = ErrorInfo::new(50000, "server rejected");
        q.nack(5, 1, nack_err.clone());

        let skip = serial_skipped_error();
        let skipped3 = outcome(&mut rxs[3]).flatten().unwrap();
        let skipped4 = outcome(&mut rxs[4]).flatten().unwrap();
        assert_eq!(skipped3.message, skip.message);
        assert_eq!(skipped4.message, skip.message);
        assert_eq!(outcome(&mut rxs[5]), Some(Some(nack_err)));
        assert!(q.is_empty());
    }

    #[test]
    fn ack_after_gap_skips_earlier_serials() {
        let mut q = PendingQueue::default();
        let mut rxs = Vec::new();
        for serial in 0..3 {
            let (tx, rx) = entry();
            q.enqueue(serial, Some(tx));
            rxs.push(rx);
        }

        // Server confirms serial 2 only; 0 and 1 were skipped.
        q.ack(2, 1, None);
        let skip = serial_skipped_error();
        assert_eq!(outcome(&mut rxs[0]).flatten().unwrap().message, skip.message);
        assert_eq!(outcome(&mut rxs[1]).flatten().unwrap().message, skip.message);
        assert_eq!(outcome(&mut rxs[2]), Some(None));
    }

    #[test]
    fn enqueue_keeps_ascending_unique_serials() {
        let mut q = PendingQueue::default();
        q.enqueue(5, None);
        q.enqueue(3, None);
        q.enqueue(7, None);
        q.enqueue(5, None); // duplicate, dropped
        assert_eq!(q.len(), 3);
        assert_eq!(
            q.queue.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            vec![3, 5, 7]
        );
    }

    #[test]
    fn fail_all_flushes_everything() {
        let mut q = PendingQueue::default();
        let (tx1, mut rx1) = entry();
        let (tx2, mut rx2) = entry();
        q.enqueue(0, Some(tx1));
        q.enqueue(1, Some(tx2));
        q.fail_all(ErrorInfo::new(80000, "connection failed"));
        assert_eq!(outcome(&mut rx1).flatten().unwrap().code, 80000);
        assert_eq!(outcome(&mut rx2).flatten().unwrap().code, 80000);
        assert!(q.is_empty());
    }

    #[test]
    fn orphaned_completion_is_silently_dropped() {
        let mut q = PendingQueue::default();
        let (tx, rx) = entry();
        drop(rx);
        q.enqueue(0, Some(tx));
        // Completing against a dropped receiver must not panic.
        q.ack(0, 1, None);
        assert!(q.is_empty());
    }

    #[test]
    fn outbound_queue_preserves_order() {
        let mut q = OutboundQueue::default();
        for serial in 0..3 {
            let msg = ProtocolMessage {
                action: action::MESSAGE,
                msg_serial: Some(serial),
                ..Default::default()
            };
            q.enqueue(msg, None);
        }
        let drained = q.drain();
        assert!(q.is_empty());
        assert_eq!(
            drained.iter().map(|(m, _)| m.msg_serial.unwrap()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn outbound_fail_all_completes_with_error() {
        let mut q = OutboundQueue::default();
        let (tx, mut rx) = entry();
        q.enqueue(
            ProtocolMessage {
                action: action::MESSAGE,
                ..Default::default()
            },
            Some(tx),
        );
        q.fail_all(ErrorInfo::new(80002, "suspended"));
        let err = outcome(&mut rx).flatten().unwrap();
        assert_eq!(err.code, 90000);
        assert!(q.is_empty());
    }
}
