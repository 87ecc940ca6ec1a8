//! In-memory [`ChatClient`] for unit tests.

use super::{ChatClient, MatrixError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Keeps `m.direct` in memory and reports every sent message as `(room, content)`.
pub(crate) struct MemoryClient {
    pub(crate) direct: Mutex<Option<Value>>,
    sent: mpsc::UnboundedSender<(String, Value)>,
    fail_sends: bool,
}

impl MemoryClient {
    pub(crate) fn new(
        direct: Option<Value>,
        fail_sends: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            direct: Mutex::new(direct),
            sent: tx,
            fail_sends,
        });
        (client, rx)
    }
}

#[async_trait]
impl ChatClient for MemoryClient {
    fn user_id(&self) -> &str {
        "@vaksi:example.com"
    }

    async fn send_message(&self, room_id: &str, content: Value) -> Result<String, MatrixError> {
        if self.fail_sends {
            return Err(MatrixError::Api {
                status: 403,
                errcode: "M_FORBIDDEN".into(),
                message: "not in room".into(),
            });
        }
        let _ = self.sent.send((room_id.to_string(), content));
        Ok("$event".to_string())
    }

    async fn get_account_data(
        &self,
        _namespace: &str,
        _room_id: Option<&str>,
    ) -> Result<Option<Value>, MatrixError> {
        let direct = self.direct.lock().unwrap().clone();
        // Let a concurrent writer interleave between our read and its write.
        tokio::task::yield_now().await;
        Ok(direct)
    }

    async fn set_account_data(
        &self,
        _namespace: &str,
        value: &Value,
        _room_id: Option<&str>,
    ) -> Result<(), MatrixError> {
        *self.direct.lock().unwrap() = Some(value.clone());
        Ok(())
    }
}
