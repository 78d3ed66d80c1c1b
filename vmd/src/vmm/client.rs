use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::Request;
use hyper::body::Bytes as HyperBytes;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::UnixStream;
use tokio::time::Instant;

use crate::errors::{Error, Result};

pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

#[derive(Serialize)]
struct MachineConfig {
    vcpu_count: i32,
    mem_size_mib: i32,
}

#[derive(Serialize)]
struct BootSource {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Serialize)]
struct Drive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Serialize)]
struct NetworkInterface {
    iface_id: String,
    host_dev_name: String,
    guest_mac: String,
}

#[derive(Serialize)]
struct InstanceAction {
    action_type: String,
}

/// Speaks the VMM's HTTP-over-Unix-socket control API. Every call opens a
/// fresh connection: the VMM is a short-lived per-VM child, so pooling
/// doesn't pay for itself across the handful of calls a lifecycle needs.
pub struct VmmClient {
    socket_path: String,
}

impl VmmClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn put_machine_config(&self, vcpus: i32, mem_size_mib: i32) -> Result<()> {
        self.put(
            "/machine-config",
            &MachineConfig {
                vcpu_count: vcpus,
                mem_size_mib,
            },
        )
        .await
    }

    pub async fn put_boot_source(&self, kernel_image_path: &str, boot_args: Option<&str>) -> Result<()> {
        self.put(
            "/boot-source",
            &BootSource {
                kernel_image_path: kernel_image_path.to_string(),
                boot_args: boot_args.unwrap_or(DEFAULT_BOOT_ARGS).to_string(),
            },
        )
        .await
    }

    pub async fn put_drive(&self, drive_id: &str, path_on_host: &str, is_root_device: bool) -> Result<()> {
        self.put(
            &format!("/drives/{drive_id}"),
            &Drive {
                drive_id: drive_id.to_string(),
                path_on_host: path_on_host.to_string(),
                is_root_device,
                is_read_only: false,
            },
        )
        .await
    }

    pub async fn put_network_interface(
        &self,
        iface_id: &str,
        host_dev_name: &str,
        guest_mac: &str,
    ) -> Result<()> {
        self.put(
            &format!("/network-interfaces/{iface_id}"),
            &NetworkInterface {
                iface_id: iface_id.to_string(),
                host_dev_name: host_dev_name.to_string(),
                guest_mac: guest_mac.to_string(),
            },
        )
        .await
    }

    pub async fn instance_start(&self) -> Result<()> {
        self.action("InstanceStart").await
    }

    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.action("SendCtrlAltDel").await
    }

    pub async fn flush_metrics(&self) -> Result<()> {
        self.action("FlushMetrics").await
    }

    async fn action(&self, action_type: &str) -> Result<()> {
        self.put(
            "/actions",
            &InstanceAction {
                action_type: action_type.to_string(),
            },
        )
        .await
    }

    /// Polls `GET /` with a capped backoff until the socket answers or
    /// `deadline` elapses.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<()> {
        let start = Instant::now();
        let mut backoff = Duration::from_millis(10);
        loop {
            if self.get("/").await.is_ok() {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(Error::Timeout(format!(
                    "vmm api at {} did not become ready within {:?}",
                    self.socket_path, deadline
                )));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(200));
        }
    }

    async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let body = serde_json::to_string(body)
            .map_err(|e| Error::VmmApi(format!("failed to encode request body: {e}")))?;
        self.request("PUT", path, Some(body)).await.map(|_| ())
    }

    async fn get(&self, path: &str) -> Result<String> {
        self.request("GET", path, None).await
    }

    async fn request(&self, method: &str, path: &str, body: Option<String>) -> Result<String> {
        if !Path::new(&self.socket_path).exists() {
            return Err(Error::VmmApi(format!(
                "socket {} does not exist",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| Error::VmmApi(format!("failed to connect to {}: {e}", self.socket_path)))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| Error::VmmApi(format!("handshake failed: {e}")))?;

        tokio::spawn(conn);

        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(format!("http://localhost{path}"))
                .header("Content-Type", "application/json")
                .body(full_body(Bytes::from(body)))
                .map_err(|e| Error::VmmApi(e.to_string()))?,
            None => Request::builder()
                .method(method)
                .uri(format!("http://localhost{path}"))
                .body(empty_body())
                .map_err(|e| Error::VmmApi(e.to_string()))?,
        };

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::VmmApi(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::VmmApi(format!("failed to read response body: {e}")))?;
        let bytes = collected.to_bytes();

        if !status.is_success() {
            return Err(Error::VmmApi(format!(
                "{method} {path} returned {status}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }

        Ok(String::from_utf8_lossy(&bytes).to_string())
    }
}

type BoxBody = http_body_util::combinators::BoxBody<HyperBytes, hyper::Error>;

fn full_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn empty_body() -> BoxBody {
    Empty::new().map_err(|never| match never {}).boxed()
}
