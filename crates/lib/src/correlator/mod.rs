//! Request/reply correlation over chat channels that have no native reply ids.
//!
//! Each named channel serves one request at a time: a request's action is
//! dispatched only after the previous request was resolved by a matching reply
//! from the channel's trusted counterpart, or timed out. A timeout abandons
//! everything still queued on that channel, since the counterpart's state can
//! no longer be trusted to line up with ours.

mod channel;
mod handle;

pub use channel::DispatchAction;
pub use handle::{CompletionHandle, Outcome};

use crate::error::CorrelationError;
use crate::matcher::{Classification, ReplyMatcher};
use crate::matrix::InboundMessage;
use channel::ChannelState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Who may answer on a channel and how their replies are recognised.
#[derive(Debug, Clone)]
pub struct ChannelRoute {
    pub counterpart: String,
    pub matcher: ReplyMatcher,
}

impl ChannelRoute {
    pub fn new(counterpart: impl Into<String>, matcher: ReplyMatcher) -> Self {
        Self {
            counterpart: counterpart.into(),
            matcher,
        }
    }
}

/// Point-in-time view of a channel's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub queued: usize,
    pub in_flight: bool,
}

/// Scheduler owning every channel's queue. Channels are created on first use and never removed.
pub struct Correlator {
    routes: RwLock<HashMap<String, ChannelRoute>>,
    channels: RwLock<HashMap<String, Arc<Mutex<ChannelState>>>>,
}

impl Correlator {
    pub fn new(routes: impl IntoIterator<Item = (String, ChannelRoute)>) -> Self {
        Self {
            routes: RwLock::new(routes.into_iter().collect()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the trust table (e.g. after a config reload). Queues are left as they are.
    pub async fn reconfigure(&self, routes: impl IntoIterator<Item = (String, ChannelRoute)>) {
        *self.routes.write().await = routes.into_iter().collect();
    }

    async fn channel(&self, name: &str) -> Option<Arc<Mutex<ChannelState>>> {
        self.channels.read().await.get(name).cloned()
    }

    async fn channel_or_create(&self, name: &str) -> Arc<Mutex<ChannelState>> {
        if let Some(ch) = self.channel(name).await {
            return ch;
        }
        let mut g = self.channels.write().await;
        g.entry(name.to_string())
            .or_insert_with(|| {
                log::debug!("channel {}: created", name);
                Arc::new(Mutex::new(ChannelState::new(name)))
            })
            .clone()
    }

    /// Queue `action` on `channel`, dispatching it right away if the channel is idle.
    pub async fn submit(&self, channel: &str, action: DispatchAction) -> CompletionHandle {
        let state = self.channel_or_create(channel).await;
        let mut state = state.lock().await;
        let handle = state.enqueue(action);
        state.try_dispatch();
        handle
    }

    /// Deliver `outcome` to the request in flight on `channel`.
    /// Returns false when nothing was waiting; such replies are dropped.
    pub async fn resolve(&self, channel: &str, outcome: Outcome) -> bool {
        let Some(state) = self.channel(channel).await else {
            log::debug!("channel {}: reply before any request was submitted", channel);
            return false;
        };
        let resolved = state.lock().await.resolve(outcome);
        resolved
    }

    /// Match an inbound notice against every channel and resolve the one it answers.
    pub async fn observe(&self, msg: &InboundMessage) {
        let hits: Vec<(String, Outcome)> = {
            let routes = self.routes.read().await;
            routes
                .iter()
                .filter_map(|(name, route)| {
                    let outcome = match route.matcher.classify(&msg.body) {
                        Classification::Irrelevant => return None,
                        Classification::Success(room) => Ok(room),
                        Classification::Failure(reason) => {
                            Err(CorrelationError::RemoteReportedFailure(reason))
                        }
                    };
                    if msg.sender != route.counterpart {
                        log::warn!(
                            "channel {}: ignoring reply-shaped message from untrusted sender {}",
                            name,
                            msg.sender
                        );
                        return None;
                    }
                    Some((name.clone(), outcome))
                })
                .collect()
        };
        for (name, outcome) in hits {
            if !self.resolve(&name, outcome).await {
                log::info!("channel {}: dropping reply in {} with nobody waiting", name, msg.room_id);
            }
        }
    }

    /// Wait for `handle` to resolve. On timeout the channel is flushed and `Unresponsive` returned.
    pub async fn await_with_timeout(&self, handle: CompletionHandle, timeout: Duration) -> Outcome {
        let CompletionHandle {
            channel,
            seq,
            mut rx,
        } = handle;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Completer dropped: our in-flight slot was cleared by a sibling's flush.
            Ok(Err(_)) => Err(CorrelationError::Abandoned),
            Err(_) => {
                let Some(state) = self.channel(&channel).await else {
                    return Err(CorrelationError::Unresponsive);
                };
                let mut state = state.lock().await;
                // A reply may have landed between the deadline and taking the lock.
                if let Ok(outcome) = rx.try_recv() {
                    return outcome;
                }
                drop(rx);
                let abandoned = state.panic_flush();
                log::warn!(
                    "channel {}: request #{} timed out after {:?}; flushed {} queued request(s)",
                    channel,
                    seq,
                    timeout,
                    abandoned
                );
                Err(CorrelationError::Unresponsive)
            }
        }
    }

    /// Submit `action` and wait for its outcome. The wait runs in its own task, so the
    /// deadline (and the flush it triggers) still fires when the caller is cancelled.
    pub async fn request(
        self: &Arc<Self>,
        channel: &str,
        action: DispatchAction,
        timeout: Duration,
    ) -> Outcome {
        let handle = self.submit(channel, action).await;
        let correlator = Arc::clone(self);
        let waiter =
            tokio::spawn(async move { correlator.await_with_timeout(handle, timeout).await });
        match waiter.await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("channel {}: waiter task failed: {}", channel, e);
                Err(CorrelationError::Unresponsive)
            }
        }
    }

    pub async fn snapshot(&self, channel: &str) -> Option<ChannelSnapshot> {
        let state = self.channel(channel).await?;
        let state = state.lock().await;
        Some(ChannelSnapshot {
            queued: state.queued(),
            in_flight: state.in_flight(),
        })
    }
}
