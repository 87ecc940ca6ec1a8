//! Per-channel FIFO queue with a single in-flight slot.

use super::handle::{completion, Completer, CompletionHandle, Outcome};
use crate::error::CorrelationError;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;

/// Side effect run when a request is dispatched (usually "send this command to the bridge bot").
/// Its result is only logged; the reply arrives through the inbound stream.
pub type DispatchAction = BoxFuture<'static, Result<(), CorrelationError>>;

struct PendingRequest {
    seq: u64,
    action: DispatchAction,
    completer: Completer,
}

struct Active {
    seq: u64,
    completer: Completer,
}

/// Queue and active slot for one channel. Mutated only through the correlator, under the channel lock.
pub(crate) struct ChannelState {
    name: String,
    queue: VecDeque<PendingRequest>,
    active: Option<Active>,
    next_seq: u64,
}

impl ChannelState {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: VecDeque::new(),
            active: None,
            next_seq: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, action: DispatchAction) -> CompletionHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (completer, handle) = completion(&self.name, seq);
        self.queue.push_back(PendingRequest {
            seq,
            action,
            completer,
        });
        handle
    }

    /// Launch the head request unless one is already in flight. Returns true if something was dispatched.
    pub(crate) fn try_dispatch(&mut self) -> bool {
        if self.active.is_some() {
            return false;
        }
        let Some(req) = self.queue.pop_front() else {
            return false;
        };
        log::info!(
            "channel {}: dispatching request #{} ({} still queued)",
            self.name,
            req.seq,
            self.queue.len()
        );
        self.active = Some(Active {
            seq: req.seq,
            completer: req.completer,
        });
        let name = self.name.clone();
        let seq = req.seq;
        let action = req.action;
        tokio::spawn(async move {
            if let Err(e) = action.await {
                log::warn!("channel {}: dispatch of request #{} failed: {}", name, seq, e);
            }
        });
        true
    }

    /// Hand `outcome` to the in-flight request and advance the queue.
    /// Returns false (and changes nothing) when no request is in flight.
    pub(crate) fn resolve(&mut self, outcome: Outcome) -> bool {
        let Some(active) = self.active.take() else {
            log::debug!("channel {}: unexpected reply with no request in flight", self.name);
            return false;
        };
        if !active.completer.complete(outcome) {
            log::debug!(
                "channel {}: request #{} resolved after its caller stopped waiting",
                self.name,
                active.seq
            );
        }
        self.try_dispatch();
        true
    }

    /// Drop the in-flight slot without resolving it and abandon everything queued.
    /// Returns how many queued requests were abandoned.
    pub(crate) fn panic_flush(&mut self) -> usize {
        self.active = None;
        let drained: Vec<PendingRequest> = self.queue.drain(..).collect();
        let count = drained.len();
        for req in drained {
            req.completer.complete(Err(CorrelationError::Abandoned));
        }
        count
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.active.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn action(tx: &mpsc::UnboundedSender<u32>, n: u32) -> DispatchAction {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(n);
            Ok(())
        })
    }

    #[tokio::test]
    async fn dispatch_is_noop_while_busy() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = ChannelState::new("slack");
        let _a = state.enqueue(action(&tx, 1));
        let _b = state.enqueue(action(&tx, 2));
        assert!(state.try_dispatch());
        assert!(!state.try_dispatch());
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(state.queued(), 1);
        assert!(state.in_flight());
    }

    #[tokio::test]
    async fn dispatch_on_empty_queue_is_noop() {
        let mut state = ChannelState::new("slack");
        assert!(!state.try_dispatch());
        assert!(!state.in_flight());
    }

    #[tokio::test]
    async fn resolve_without_active_slot_leaves_queue_alone() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut state = ChannelState::new("slack");
        let _a = state.enqueue(action(&tx, 1));
        assert!(!state.resolve(Ok("!room:x".into())));
        assert_eq!(state.queued(), 1);
        assert!(!state.in_flight());
    }

    #[tokio::test]
    async fn resolve_delivers_and_advances() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = ChannelState::new("slack");
        let a = state.enqueue(action(&tx, 1));
        let _b = state.enqueue(action(&tx, 2));
        state.try_dispatch();
        assert!(state.resolve(Ok("!roomA:x".into())));
        assert_eq!(a.rx.await.unwrap(), Ok("!roomA:x".to_string()));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert!(state.in_flight());
        assert_eq!(state.queued(), 0);
    }

    #[tokio::test]
    async fn flush_abandons_queued_and_clears_active() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut state = ChannelState::new("slack");
        let a = state.enqueue(action(&tx, 1));
        let b = state.enqueue(action(&tx, 2));
        let c = state.enqueue(action(&tx, 3));
        state.try_dispatch();
        assert_eq!(state.panic_flush(), 2);
        assert!(!state.in_flight());
        assert_eq!(state.queued(), 0);
        assert_eq!(b.rx.await.unwrap(), Err(CorrelationError::Abandoned));
        assert_eq!(c.rx.await.unwrap(), Err(CorrelationError::Abandoned));
        // the in-flight slot is dropped, not resolved
        assert!(a.rx.await.is_err());
    }
}
