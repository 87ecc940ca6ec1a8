//! Gateway: HTTP API over the session facade, plus the bot runtime that hosts it.
//!
//! Single port. `GET /` is an unauthenticated health probe; `GET /dms` and
//! `POST /dm` require a bearer token when tokens are configured.

mod protocol;
mod server;

pub use protocol::{DmRequest, DmResponse, ErrorBody};
pub use server::{router, run_bot, GatewayState};
