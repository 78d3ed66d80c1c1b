use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;

use crate::configuration::WatchdogSettings;
use crate::db::vms::{self, VmStatus};
use crate::network::NetworkAllocator;
use crate::terminal::TerminalRegistry;
use crate::vmm::supervisor::Supervisor;

/// Periodically verifies that every `running` row's pid is still alive.
/// Never takes the lifecycle mutex; uses a conditional single-row update so
/// a concurrent `stop`/`start` always wins the race.
pub async fn run_vm_watchdog(
    pool: PgPool,
    network: Arc<NetworkAllocator>,
    supervisor: Arc<Supervisor>,
    terminal_registry: TerminalRegistry,
    settings: WatchdogSettings,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(settings.vm_watchdog_ms));
    loop {
        interval.tick().await;

        let running = match vms::list_by_status(&pool, VmStatus::Running).await {
            Ok(vms) => vms,
            Err(e) => {
                tracing::error!(error = %e, "vm watchdog failed to list running vms");
                continue;
            }
        };

        for vm in running {
            let Some(pid) = vm.pid else { continue };
            if supervisor.is_alive(pid) {
                continue;
            }

            tracing::warn!(vm_id = %vm.id, pid, "vmm process found dead, reconciling");

            // The VM is leaving `running`: trip any attached terminal's
            // cancellation before anything else, since its pump holds its
            // own fd on the FIFO and will never see EOF from the dead guest.
            terminal_registry.cancel(vm.id).await;
            supervisor.cleanup_paths(&vm.id.to_string());

            if let (Some(tap), Some(mac), Some(ip)) =
                (vm.tap_device.clone(), vm.mac_address.clone(), vm.ip_address.clone())
            {
                network
                    .release(&crate::network::NetworkTriple {
                        tap_device: tap,
                        mac_address: mac,
                        ip_address: ip,
                    })
                    .await;
            }

            match vms::reconcile_dead(&pool, vm.id, vm.updated_at).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(vm_id = %vm.id, "skipped reconcile: vm mutated concurrently");
                }
                Err(e) => tracing::error!(vm_id = %vm.id, error = %e, "failed to reconcile dead vm"),
            }
        }
    }
}

/// Times out VMs stuck in `creating` past a threshold, marking them `error`.
pub async fn run_bootstrap_watchdog(pool: PgPool, settings: WatchdogSettings) {
    let mut interval = tokio::time::interval(Duration::from_millis(settings.bootstrap_watchdog_ms));
    const STALL_THRESHOLD: chrono::Duration = chrono::Duration::minutes(10);

    loop {
        interval.tick().await;

        let creating = match vms::list_by_status(&pool, VmStatus::Creating).await {
            Ok(vms) => vms,
            Err(e) => {
                tracing::error!(error = %e, "bootstrap watchdog failed to list creating vms");
                continue;
            }
        };

        let deadline = Utc::now() - STALL_THRESHOLD;
        for vm in creating {
            if vm.updated_at >= deadline {
                continue;
            }
            match vms::reconcile_stalled_creation(&pool, vm.id, deadline).await {
                Ok(true) => tracing::warn!(vm_id = %vm.id, "marked stalled creation as error"),
                Ok(false) => {}
                Err(e) => tracing::error!(vm_id = %vm.id, error = %e, "failed to reconcile stalled creation"),
            }
        }
    }
}
