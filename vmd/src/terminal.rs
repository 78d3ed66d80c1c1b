use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::vmm::pipes::{self, PipePaths};

const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Deserialize)]
struct ResizeFrame {
    resize: ResizeDims,
}

#[derive(Deserialize)]
struct ResizeDims {
    cols: u32,
    rows: u32,
}

/// Enforces "at most one active terminal per VM" via compare-and-set on a
/// shared map of connection tokens. The map's value is the same `Notify`
/// `run_session` selects on, so the lifecycle service and the watchdogs can
/// reach an in-flight session from outside the WebSocket task and tear it
/// down when the VM stops being `running`.
#[derive(Default, Clone)]
pub struct TerminalRegistry {
    active: Arc<Mutex<HashMap<Uuid, Arc<Notify>>>>,
}

pub struct ConnectionGuard {
    registry: TerminalRegistry,
    id: Uuid,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let id = self.id;
        tokio::spawn(async move {
            registry.active.lock().await.remove(&id);
        });
    }
}

impl TerminalRegistry {
    /// Registers `id` if no connection currently holds it. Returns `None`
    /// if one is already attached.
    pub async fn try_acquire(&self, id: Uuid) -> Option<(ConnectionGuard, Arc<Notify>)> {
        let mut active = self.active.lock().await;
        if active.contains_key(&id) {
            return None;
        }
        let cancel = Arc::new(Notify::new());
        active.insert(id, cancel.clone());
        drop(active);
        Some((
            ConnectionGuard {
                registry: self.clone(),
                id,
            },
            cancel,
        ))
    }

    /// Trips the cancellation notify for `id`'s session, if one is active.
    /// A no-op if no terminal is currently attached to that VM.
    pub async fn cancel(&self, id: Uuid) {
        if let Some(cancel) = self.active.lock().await.get(&id) {
            cancel.notify_waiters();
        }
    }
}

/// Drives one terminal session end to end: opens the pipes, sends `ready`,
/// and runs the guest→client and client→guest pumps until either side
/// closes or `cancel` is tripped (by a lifecycle `stop` or a watchdog
/// reconciling the VM out of `running`).
pub async fn run_session(socket: WebSocket, vm_dir: PathBuf, id: Uuid, cancel: Arc<Notify>) {
    let paths = PipePaths::for_vm(&vm_dir, &id.to_string());

    let stdout = match pipes::open_read_write(&paths.stdout).await {
        Ok(f) => f,
        Err(e) => {
            send_error(socket, &e.to_string()).await;
            return;
        }
    };
    let stdin = match pipes::open_read_write(&paths.stdin).await {
        Ok(f) => f,
        Err(e) => {
            send_error(socket, &e.to_string()).await;
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = socket.split();

    if ws_sink
        .send(Message::Text(r#"{"ready":true}"#.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut stdout = stdout;
    let mut stdin = stdin;

    // Drain anything already buffered before this session started so a
    // reconnect never replays a previous session's output.
    drain_stale(&mut stdout).await;

    let guest_to_client = {
        let cancel = cancel.clone();
        async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.notified() => break,
                    n = stdout.read(&mut buf) => {
                        match n {
                            Ok(0) => break,
                            Ok(n) => {
                                if ws_sink.send(Message::Binary(buf[..n].to_vec().into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            cancel.notify_waiters();
        }
    };

    let client_to_guest = {
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.notified() => break,
                    msg = ws_stream.next() => {
                        match msg.and_then(|m| m.ok()) {
                            Some(Message::Binary(data)) => {
                                if stdin.write_all(&data).await.is_err() {
                                    break;
                                }
                            }
                            Some(Message::Text(text)) => {
                                if let Some(escape) = resize_escape(&text) {
                                    if stdin.write_all(&escape).await.is_err() {
                                        break;
                                    }
                                } else if stdin.write_all(text.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            Some(Message::Close(_)) | None => break,
                            _ => {}
                        }
                    }
                }
            }
            cancel.notify_waiters();
        }
    };

    tokio::join!(guest_to_client, client_to_guest);
}

/// Translates `{"resize":{"cols":C,"rows":R}}` into the in-band escape
/// `ESC [ 8 ; rows ; cols t`. Returns `None` for any other text frame, which
/// is forwarded to the guest verbatim.
fn resize_escape(text: &str) -> Option<Vec<u8>> {
    let frame: ResizeFrame = serde_json::from_str(text).ok()?;
    if frame.resize.cols == 0 || frame.resize.rows == 0 {
        return None;
    }
    Some(format!("\x1b[8;{};{}t", frame.resize.rows, frame.resize.cols).into_bytes())
}

async fn drain_stale(stdout: &mut tokio::fs::File) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match tokio::time::timeout(std::time::Duration::from_millis(1), stdout.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => break,
        }
    }
}

async fn send_error(mut socket: WebSocket, message: &str) {
    let frame = serde_json::json!({ "error": message }).to_string();
    let _ = socket.send(Message::Text(frame.into())).await;
    let _ = socket.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_frame_translates_to_escape_sequence() {
        let escape = resize_escape(r#"{"resize":{"cols":80,"rows":24}}"#).unwrap();
        assert_eq!(escape, b"\x1b[8;24;80t");
    }

    #[test]
    fn zero_sized_resize_is_rejected() {
        assert!(resize_escape(r#"{"resize":{"cols":0,"rows":24}}"#).is_none());
    }

    #[test]
    fn unrelated_json_is_not_treated_as_resize() {
        assert!(resize_escape(r#"{"hello":"world"}"#).is_none());
    }

    #[tokio::test]
    async fn registry_refuses_second_connection_for_same_vm() {
        let registry = TerminalRegistry::default();
        let id = Uuid::new_v4();

        let first = registry.try_acquire(id).await;
        assert!(first.is_some());

        let second = registry.try_acquire(id).await;
        assert!(second.is_none());

        drop(first);
        // the guard's drop spawns a task to release the slot; yield so it runs.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let third = registry.try_acquire(id).await;
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn cancel_wakes_the_registered_session() {
        let registry = TerminalRegistry::default();
        let id = Uuid::new_v4();
        let (_guard, cancel) = registry.try_acquire(id).await.unwrap();

        let waiter = tokio::spawn(async move {
            cancel.notified().await;
        });

        // `notify_waiters` only wakes tasks already parked on `.notified()`;
        // yield until the spawned task has reached that await point.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        registry.cancel(id).await;
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter)
            .await
            .expect("cancel should wake the waiting session")
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_on_unknown_id_is_a_noop() {
        let registry = TerminalRegistry::default();
        registry.cancel(Uuid::new_v4()).await;
    }
}
