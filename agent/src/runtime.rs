//! Explicit execution context
//!
//! Owns the device inventory source and the active/shut-down lifecycle. A
//! [`Dispatcher`](crate::Dispatcher) takes one by value and releases it
//! exactly once when it is shut down or dropped. Clones share the same
//! lifecycle, so any clone observes the shutdown.

use crate::config::{FleetConfig, InventorySourceKind};
use crate::device::{InventorySource, NvidiaSmiInventory, StaticInventory};
use crate::errors::{AgentError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct RuntimeContext {
    id: Uuid,
    inventory: Arc<dyn InventorySource>,
    active: Arc<AtomicBool>,
}

impl RuntimeContext {
    /// Build a context from configuration.
    ///
    /// # Errors
    /// `AgentError::RuntimeUnavailable` if no tokio runtime is running or the
    /// inventory settings cannot be used.
    pub fn init(config: &FleetConfig) -> Result<Self> {
        let inventory: Arc<dyn InventorySource> = match config.inventory.source {
            InventorySourceKind::NvidiaSmi => {
                Arc::new(NvidiaSmiInventory::new(&config.inventory.nvidia_smi_path))
            }
            InventorySourceKind::Static => {
                let count = config.inventory.device_count.ok_or_else(|| {
                    AgentError::RuntimeUnavailable(
                        "static inventory configured without device_count".into(),
                    )
                })?;
                Arc::new(StaticInventory::new(count))
            }
        };

        Self::with_inventory(inventory)
    }

    /// Build a context around an existing inventory source.
    pub fn with_inventory(inventory: Arc<dyn InventorySource>) -> Result<Self> {
        tokio::runtime::Handle::try_current().map_err(|e| {
            AgentError::RuntimeUnavailable(format!("no async runtime is running: {}", e))
        })?;

        let id = Uuid::new_v4();
        info!(context_id = %id, inventory = inventory.name(), "Runtime context initialized");

        Ok(Self {
            id,
            inventory,
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(AgentError::RuntimeUnavailable(format!(
                "runtime context {} has been shut down",
                self.id
            )))
        }
    }

    pub fn inventory_name(&self) -> &str {
        self.inventory.name()
    }

    /// Ask the inventory source how many slots are available.
    pub async fn available_slots(&self) -> Result<usize> {
        self.ensure_active()?;
        self.inventory.available_slots().await
    }

    /// Release the context. Returns false if it was already released.
    pub fn shutdown(&self) -> bool {
        let released = self.active.swap(false, Ordering::AcqRel);
        if released {
            info!(context_id = %self.id, "Runtime context shut down");
        }
        released
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("id", &self.id)
            .field("inventory", &self.inventory.name())
            .field("active", &self.is_active())
            .finish()
    }
}
