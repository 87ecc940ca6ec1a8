//! Write-once completion slot shared between a waiting caller and the channel that will resolve it.

use crate::error::CorrelationError;
use tokio::sync::oneshot;

/// Result delivered to a waiting caller: the conversation id, or why there is none.
pub type Outcome = Result<String, CorrelationError>;

/// Caller side of a pending request. Await it with [`super::Correlator::await_with_timeout`].
#[derive(Debug)]
pub struct CompletionHandle {
    pub(crate) channel: String,
    pub(crate) seq: u64,
    pub(crate) rx: oneshot::Receiver<Outcome>,
}

/// Resolver side. Consumed on completion, so a slot can only be written once.
#[derive(Debug)]
pub(crate) struct Completer {
    tx: oneshot::Sender<Outcome>,
}

impl Completer {
    /// Deliver the outcome. Returns false when the caller stopped waiting.
    pub(crate) fn complete(self, outcome: Outcome) -> bool {
        self.tx.send(outcome).is_ok()
    }
}

pub(crate) fn completion(channel: &str, seq: u64) -> (Completer, CompletionHandle) {
    let (tx, rx) = oneshot::channel();
    (
        Completer { tx },
        CompletionHandle {
            channel: channel.to_string(),
            seq,
            rx,
        },
    )
}
