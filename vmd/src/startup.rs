use std::path::PathBuf;
use std::sync::Arc;

use axum::{Router, routing::IntoMakeService, serve::Serve};
use sqlx::PgPool;
use tokio::net::TcpListener;

use crate::configuration::Settings;
use crate::http::app;
use crate::lifecycle::LifecycleService;
use crate::network::NetworkAllocator;
use crate::terminal::TerminalRegistry;
use crate::vmm::supervisor::Supervisor;
use crate::{App, db::vms};

pub async fn run(
    listener: TcpListener,
    db_pool: PgPool,
    settings: Settings,
) -> Result<Serve<IntoMakeService<Router>, Router>, Box<dyn std::error::Error + Send>> {
    let network = Arc::new(
        NetworkAllocator::new(&settings.network)
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send>)?,
    );

    let running = vms::list_by_status(&db_pool, vms::VmStatus::Running)
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send>)?;
    network.reclaim_from(&running).await;

    let terminal_registry = TerminalRegistry::default();

    let supervisor = Supervisor::new(settings.vmm.clone(), settings.timeouts.clone());
    let lifecycle = Arc::new(LifecycleService::new(
        db_pool.clone(),
        network.clone(),
        supervisor,
        terminal_registry.clone(),
    ));

    let vm_dir = PathBuf::from(&settings.vmm.vm_dir);
    let a = App::new(lifecycle, terminal_registry.clone(), vm_dir);

    tokio::spawn(crate::watchdog::run_vm_watchdog(
        db_pool.clone(),
        network.clone(),
        Arc::new(Supervisor::new(settings.vmm.clone(), settings.timeouts.clone())),
        terminal_registry,
        settings.watchdogs.clone(),
    ));
    tokio::spawn(crate::watchdog::run_bootstrap_watchdog(
        db_pool,
        settings.watchdogs.clone(),
    ));

    let app = app(a);
    let server = axum::serve(listener, app.into_make_service());
    Ok(server)
}
