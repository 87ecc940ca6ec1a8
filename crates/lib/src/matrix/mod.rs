//! Matrix client-server API: the chat transport the bot talks through.
//!
//! `ChatClient` is the seam the session facade calls; `MatrixClient` implements it
//! over HTTP. Inbound room messages come from a `/sync` long-poll loop.

mod client;
mod inbound;
mod sync;
#[cfg(test)]
pub(crate) mod testing;

pub use client::{message_content, ChatClient, MatrixClient, MatrixError};
pub use inbound::{InboundMessage, MessageKind};
pub use sync::start_sync;
