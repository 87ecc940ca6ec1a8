//! Vaksi core library: opens bridged direct conversations on Matrix by sending
//! commands to a bridge bot and correlating its replies, one request at a time
//! per bridge.

pub mod config;
pub mod correlator;
pub mod error;
pub mod gateway;
pub mod init;
pub mod matcher;
pub mod matrix;
pub mod session;
