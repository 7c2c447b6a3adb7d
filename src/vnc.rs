//! VNC access broker: per-task ephemeral tokens and the token-gated
//! WebSocket↔TCP bridge to the local VNC server.
//!
//! The store owns the current token inside each task record; this module
//! generates tokens, answers the gate question under the task's slot lock,
//! and streams bytes once a connection is admitted.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::security::constant_time_eq;
use crate::store::TaskStore;

/// Mint a fresh 128-bit URL-safe token.
pub fn new_token() -> String {
    let mut buf = [0u8; 16];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Why a connection was refused at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VncDenied {
    /// Unknown task, or the task has no open browser session.
    NotFound,
    /// Token does not match the live mapping.
    Forbidden,
}

pub struct VncBroker {
    store: Arc<TaskStore>,
    target_host: String,
    target_port: u16,
}

impl VncBroker {
    pub fn new(store: Arc<TaskStore>, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            store,
            target_host: target_host.into(),
            target_port,
        }
    }

    /// Decide admission before the WebSocket upgrade. Reads `browser_open`
    /// and the current token under the task's slot lock.
    pub async fn authorize(&self, task_id: &str, token: &str) -> Result<(), VncDenied> {
        let Some(slot) = self.store.slot(task_id) else {
            return Err(VncDenied::NotFound);
        };
        let state = slot.state.lock().await;
        if !state.record.browser_open {
            return Err(VncDenied::NotFound);
        }
        match state.record.vnc_token.as_deref() {
            Some(live) if constant_time_eq(live, token) => Ok(()),
            _ => Err(VncDenied::Forbidden),
        }
    }

    /// Bridge an admitted WebSocket to the backend VNC socket until either
    /// side closes.
    pub async fn proxy(&self, socket: WebSocket, task_id: String) {
        let target = format!("{}:{}", self.target_host, self.target_port);
        let tcp = match TcpStream::connect(&target).await {
            Ok(tcp) => tcp,
            Err(error) => {
                tracing::warn!(%task_id, %error, "vnc backend unreachable");
                return;
            }
        };
        tracing::debug!(%task_id, "vnc bridge established");

        let (mut ws_tx, mut ws_rx) = socket.split();
        let (mut tcp_rx, mut tcp_tx) = tcp.into_split();

        let client_to_backend = async {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        if tcp_tx.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };

        let backend_to_client = async {
            let mut buf = [0u8; 8192];
            loop {
                match tcp_rx.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if ws_tx
                            .send(Message::Binary(buf[..n].to_vec().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        };

        tokio::select! {
            () = client_to_backend => {}
            () = backend_to_client => {}
        }
        tracing::debug!(%task_id, "vnc bridge closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskRecord, TaskStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record_with_browser(id: &str, open: bool, token: Option<&str>) -> TaskRecord {
        TaskRecord {
            id: id.into(),
            node_id: "node-1".into(),
            title: "t".into(),
            instructions: "i".into(),
            model_name: "gpt-5".into(),
            temperature: None,
            reasoning_effort: None,
            max_steps: 5,
            leave_browser_open: open,
            status: TaskStatus::Completed,
            scheduled_for: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            step_count: 0,
            browser_open: open,
            needs_attention: false,
            last_error: None,
            result_summary: None,
            assistance: None,
            vnc_token: token.map(Into::into),
        }
    }

    fn broker_with(record: TaskRecord) -> (VncBroker, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(tmp.path()).unwrap());
        store.insert(record, Vec::new()).unwrap();
        (VncBroker::new(store, "127.0.0.1", 5902), tmp)
    }

    #[test]
    fn tokens_are_urlsafe_and_unique() {
        let a = new_token();
        let b = new_token();
        assert_ne!(a, b);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
        // 16 bytes → 22 base64url chars.
        assert_eq!(a.len(), 22);
    }

    #[tokio::test]
    async fn matching_token_is_admitted() {
        let (broker, _tmp) = broker_with(record_with_browser("t1", true, Some("tok")));
        assert!(broker.authorize("t1", "tok").await.is_ok());
    }

    #[tokio::test]
    async fn wrong_token_is_forbidden() {
        let (broker, _tmp) = broker_with(record_with_browser("t1", true, Some("tok")));
        assert_eq!(
            broker.authorize("t1", "other").await.unwrap_err(),
            VncDenied::Forbidden
        );
    }

    #[tokio::test]
    async fn closed_browser_is_not_found() {
        let (broker, _tmp) = broker_with(record_with_browser("t1", false, Some("tok")));
        assert_eq!(
            broker.authorize("t1", "tok").await.unwrap_err(),
            VncDenied::NotFound
        );
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (broker, _tmp) = broker_with(record_with_browser("t1", true, Some("tok")));
        assert_eq!(
            broker.authorize("nope", "tok").await.unwrap_err(),
            VncDenied::NotFound
        );
    }
}
