use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::vms::{self, NewVm, RunningInfo, Vm, VmStatus};
use crate::db::images;
use crate::errors::{Error, Result};
use crate::network::NetworkAllocator;
use crate::terminal::TerminalRegistry;
use crate::vmm::supervisor::{Supervisor, VmConfiguration, VmmHandle};

/// Serializes lifecycle operations per VM id without blocking operations on
/// other VMs. Lazily inserts a guard per id, mirroring the lock-striping
/// shape used for this family's node-side VM map.
#[derive(Default)]
struct LockTable {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl LockTable {
    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

pub struct LifecycleService {
    pool: PgPool,
    network: Arc<NetworkAllocator>,
    supervisor: Supervisor,
    terminal_registry: TerminalRegistry,
    locks: LockTable,
}

impl LifecycleService {
    pub fn new(
        pool: PgPool,
        network: Arc<NetworkAllocator>,
        supervisor: Supervisor,
        terminal_registry: TerminalRegistry,
    ) -> Self {
        Self {
            pool,
            network,
            supervisor,
            terminal_registry,
            locks: LockTable::default(),
        }
    }

    pub async fn list(&self) -> Result<Vec<Vm>> {
        vms::list(&self.pool).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Vm> {
        vms::get(&self.pool, id).await
    }

    pub async fn create(&self, new: &NewVm) -> Result<Vm> {
        images::get(&self.pool, new.image_id).await?;
        vms::create(&self.pool, new).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let guard = self.locks.lock_for(id).await;
        let _permit = guard.lock().await;
        vms::delete(&self.pool, id).await?;
        self.supervisor.cleanup_paths(&id.to_string());
        Ok(())
    }

    /// Runs the ordered allocate → spawn → configure → start sequence,
    /// undoing completed steps in reverse on any failure.
    pub async fn start(&self, id: Uuid) -> Result<Vm> {
        let guard = self.locks.lock_for(id).await;
        let _permit = guard.lock().await;

        let vm = vms::get(&self.pool, id).await?;
        if !matches!(vm.status, VmStatus::Stopped | VmStatus::Error) {
            return Err(Error::Conflict(format!(
                "vm {id} cannot be started from status {}",
                vm.status
            )));
        }
        let image = images::get(&self.pool, vm.image_id).await?;

        let network = self.network.allocate().await?;

        let handle = match self.supervisor.spawn(&id.to_string()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.network.release(&network).await;
                let _ = vms::mark_error(&self.pool, id, &e.to_string()).await;
                return Err(e);
            }
        };

        let config = VmConfiguration {
            vcpus: vm.vcpus,
            memory_mib: vm.memory_mib,
            kernel_path: &image.kernel_path,
            rootfs_path: &image.rootfs_path,
            network: &network,
        };

        if let Err(e) = self.supervisor.configure(&handle, &config).await {
            self.rollback_spawn(&handle, &network).await;
            let _ = vms::mark_error(&self.pool, id, &e.to_string()).await;
            return Err(e);
        }

        if let Err(e) = self.supervisor.start(&handle).await {
            self.rollback_spawn(&handle, &network).await;
            let _ = vms::mark_error(&self.pool, id, &e.to_string()).await;
            return Err(e);
        }

        let info = RunningInfo {
            pid: handle.pid,
            socket_path: handle.socket_path.to_string_lossy().to_string(),
            tap_device: network.tap_device.clone(),
            mac_address: network.mac_address.clone(),
            ip_address: network.ip_address.clone(),
        };

        vms::mark_running(&self.pool, id, &info).await
    }

    async fn rollback_spawn(&self, handle: &VmmHandle, network: &crate::network::NetworkTriple) {
        if let Err(e) = self.supervisor.stop(handle).await {
            tracing::warn!(error = %e, "failed to stop vmm during start rollback");
        }
        self.network.release(network).await;
    }

    pub async fn stop(&self, id: Uuid) -> Result<Vm> {
        let guard = self.locks.lock_for(id).await;
        let _permit = guard.lock().await;

        let vm = vms::get(&self.pool, id).await?;
        if vm.status != VmStatus::Running {
            return Err(Error::Conflict(format!("vm {id} is not running")));
        }

        // Tear down any attached terminal before touching the VMM process:
        // the session's pump holds its own read+write fd on the FIFO, so a
        // dying guest never produces EOF for it on its own.
        self.terminal_registry.cancel(id).await;

        let pipe_paths = self.supervisor.pipe_paths(&id.to_string());
        let handle = VmmHandle {
            pid: vm.pid.ok_or_else(|| Error::Internal(anyhow::anyhow!("running vm missing pid")))?,
            socket_path: vm
                .socket_path
                .clone()
                .ok_or_else(|| Error::Internal(anyhow::anyhow!("running vm missing socket_path")))?
                .into(),
            stdin_path: pipe_paths.stdin,
            stdout_path: pipe_paths.stdout,
        };

        let stop_result = self.supervisor.stop(&handle).await;

        let network = crate::network::NetworkTriple {
            tap_device: vm.tap_device.clone().unwrap_or_default(),
            mac_address: vm.mac_address.clone().unwrap_or_default(),
            ip_address: vm.ip_address.clone().unwrap_or_default(),
        };
        self.network.release(&network).await;

        match stop_result {
            Ok(()) => vms::clear_runtime(&self.pool, id, VmStatus::Stopped).await,
            Err(e) => {
                tracing::error!(error = %e, "vmm failed to stop cleanly");
                vms::mark_error(&self.pool, id, &e.to_string()).await
            }
        }
    }
}
