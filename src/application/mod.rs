use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;

pub mod command_handlers;
pub mod dependency_container;

pub use command_handlers::{BackupCommandHandler, ConfigCommandHandler, DatabaseCommandHandler};
pub use dependency_container::DependencyContainer;

/// Application layer - wires configuration to the backup engine for the CLI
pub struct Application {
    pub container: Arc<DependencyContainer>,
}

impl Application {
    pub fn new(config: Config) -> Result<Self> {
        let container = Arc::new(DependencyContainer::new(config)?);
        Ok(Self { container })
    }

    pub async fn initialize(&self) -> Result<()> {
        self.container.initialize().await
    }

    pub async fn shutdown(&self) {
        self.container.shutdown().await
    }
}
