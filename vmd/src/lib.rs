pub mod configuration;
pub mod db;
pub mod errors;
pub mod http;
pub mod lifecycle;
pub mod network;
pub mod startup;
pub mod terminal;
pub mod vmm;
pub mod watchdog;

use std::path::PathBuf;
use std::sync::Arc;

use crate::lifecycle::LifecycleService;
use crate::terminal::TerminalRegistry;

#[derive(Clone)]
pub struct App {
    lifecycle: Arc<LifecycleService>,
    terminal_registry: TerminalRegistry,
    vm_dir: PathBuf,
}

impl App {
    pub fn new(lifecycle: Arc<LifecycleService>, terminal_registry: TerminalRegistry, vm_dir: PathBuf) -> Self {
        Self {
            lifecycle,
            terminal_registry,
            vm_dir,
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleService> {
        &self.lifecycle
    }
}
