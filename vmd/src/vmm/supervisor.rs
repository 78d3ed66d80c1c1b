use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::time::Instant;

use crate::configuration::{NetworkSettings, TimeoutSettings, VmmSettings};
use crate::errors::{Error, Result};
use crate::network::NetworkTriple;
use crate::vmm::client::VmmClient;
use crate::vmm::pipes;

/// Everything needed to address a running VMM child once it has been
/// spawned: its pid, control socket, and serial pipe paths.
#[derive(Debug, Clone)]
pub struct VmmHandle {
    pub pid: i32,
    pub socket_path: PathBuf,
    pub stdin_path: PathBuf,
    pub stdout_path: PathBuf,
}

pub struct VmConfiguration<'a> {
    pub vcpus: i32,
    pub memory_mib: i32,
    pub kernel_path: &'a str,
    pub rootfs_path: &'a str,
    pub network: &'a NetworkTriple,
}

pub struct Supervisor {
    vmm_settings: VmmSettings,
    timeouts: TimeoutSettings,
}

impl Supervisor {
    pub fn new(vmm_settings: VmmSettings, timeouts: TimeoutSettings) -> Self {
        Self {
            vmm_settings,
            timeouts,
        }
    }

    fn vm_dir(&self) -> &Path {
        Path::new(&self.vmm_settings.vm_dir)
    }

    /// Reconstructs the serial pipe paths for `id` without touching the
    /// filesystem — used to rebuild a `VmmHandle` for a VM that is already
    /// running rather than one this process just spawned.
    pub fn pipe_paths(&self, id: &str) -> pipes::PipePaths {
        pipes::PipePaths::for_vm(self.vm_dir(), id)
    }

    pub async fn spawn(&self, id: &str) -> Result<VmmHandle> {
        tokio::fs::create_dir_all(self.vm_dir())
            .await
            .map_err(|e| Error::Spawn(format!("failed to create vm dir: {e}")))?;

        let socket_path = self.vm_dir().join(format!("{id}.sock"));
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }

        let pipe_paths = pipes::create(self.vm_dir(), id)?;
        let log_path = self.vm_dir().join(format!("{id}.log"));
        let log_file = std::fs::File::create(&log_path)
            .map_err(|e| Error::Spawn(format!("failed to create log file: {e}")))?;

        let mut child = Command::new(&self.vmm_settings.binary_path)
            .arg("--api-sock")
            .arg(&socket_path)
            .stderr(log_file)
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to spawn vmm: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("vmm exited before reporting a pid".into()))?;

        // A child that exits immediately (bad binary, bad args) should fail
        // the spawn rather than leave a ghost VM behind.
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| Error::Spawn(format!("vmm wait failed: {e}")))?;
                pipes::destroy(self.vm_dir(), id);
                return Err(Error::Spawn(format!("vmm exited immediately with status {status}")));
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        // `kill_on_drop` defaults to false, so dropping `child` here hands
        // the process to Tokio's orphan reaper: its exit status still gets
        // collected (no zombie), but nothing kills it. Shutdown and the
        // watchdog reach it again via pid, not via this `Child`.
        drop(child);

        Ok(VmmHandle {
            pid: pid as i32,
            socket_path,
            stdin_path: pipe_paths.stdin,
            stdout_path: pipe_paths.stdout,
        })
    }

    pub async fn configure(&self, handle: &VmmHandle, config: &VmConfiguration<'_>) -> Result<()> {
        let client = VmmClient::new(handle.socket_path.to_string_lossy().to_string());
        client
            .wait_ready(Duration::from_millis(self.timeouts.api_ready_timeout_ms))
            .await?;

        client
            .put_machine_config(config.vcpus, config.memory_mib)
            .await?;
        client.put_boot_source(config.kernel_path, None).await?;
        client
            .put_drive("rootfs", config.rootfs_path, true)
            .await?;
        client
            .put_network_interface("eth0", &config.network.tap_device, &config.network.mac_address)
            .await?;
        Ok(())
    }

    pub async fn start(&self, handle: &VmmHandle) -> Result<()> {
        VmmClient::new(handle.socket_path.to_string_lossy().to_string())
            .instance_start()
            .await
    }

    /// Three-phase shutdown: `SendCtrlAltDel` then poll, `SIGTERM` then poll,
    /// and finally `SIGKILL` as a last resort so a wedged VMM can never block
    /// network/resource release. Returns `Ok(())` once the process is
    /// confirmed gone by any phase; only a pid that survives `SIGKILL` fails.
    pub async fn stop(&self, handle: &VmmHandle) -> Result<()> {
        if self.is_alive(handle.pid) {
            let client = VmmClient::new(handle.socket_path.to_string_lossy().to_string());
            let _ = client.send_ctrl_alt_del().await;
            if self
                .poll_exit(handle.pid, Duration::from_millis(self.timeouts.graceful_stop_ms))
                .await
            {
                self.cleanup(handle);
                return Ok(());
            }
        }

        if self.is_alive(handle.pid) {
            let _ = signal::kill(Pid::from_raw(handle.pid), Signal::SIGTERM);
            if self
                .poll_exit(handle.pid, Duration::from_millis(self.timeouts.sigterm_stop_ms))
                .await
            {
                self.cleanup(handle);
                return Ok(());
            }
        }

        if self.is_alive(handle.pid) {
            tracing::warn!(pid = handle.pid, "vmm ignored graceful and SIGTERM shutdown, sending SIGKILL");
            let _ = signal::kill(Pid::from_raw(handle.pid), Signal::SIGKILL);
            if !self.poll_exit(handle.pid, Duration::from_millis(2000)).await {
                return Err(Error::VmmApi(format!(
                    "vmm pid {} survived SIGKILL",
                    handle.pid
                )));
            }
        }

        self.cleanup(handle);
        Ok(())
    }

    fn cleanup(&self, handle: &VmmHandle) {
        let _ = std::fs::remove_file(&handle.socket_path);
        if let Some(id) = handle
            .stdin_path
            .file_stem()
            .and_then(|s| s.to_str())
        {
            pipes::destroy(self.vm_dir(), id);
        }
    }

    /// Best-effort removal of `id`'s control socket and serial pipes, keyed
    /// directly by id rather than a live `VmmHandle` — used by `delete` and
    /// the VM watchdog, which only have the id, not a handle from this
    /// process's own `spawn`.
    pub fn cleanup_paths(&self, id: &str) {
        let socket_path = self.vm_dir().join(format!("{id}.sock"));
        let _ = std::fs::remove_file(&socket_path);
        pipes::destroy(self.vm_dir(), id);
    }

    async fn poll_exit(&self, pid: i32, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if !self.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        !self.is_alive(pid)
    }

    pub fn is_alive(&self, pid: i32) -> bool {
        signal::kill(Pid::from_raw(pid), None).is_ok()
    }
}
