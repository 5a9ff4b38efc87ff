//! Fabric table and commissioning lifecycle.
//!
//! ```text
//! Idle ──arm_fail_safe──▶ Arming(builder) ──tentatively_add_fabric──▶ Committed(fabric)
//!   ▲                         │                                           │
//!   └──────revert_fail_safe───┴───────────────complete_commission─────────┘
//! ```
//!
//! Every operation checks the current state and returns
//! [`FabricLifecycleError::InvalidTransition`] instead of panicking.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use tessel_common::helpers::constant_time_eq;
use tessel_crypto::{Fabric, FabricBuilder, FabricError, FabricIndex};

#[derive(Debug, Error)]
pub enum FabricLifecycleError {
    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },

    #[error("fabric {0} not found")]
    FabricNotFound(FabricIndex),

    #[error("no fabric matches the destination id")]
    NoMatchingFabric,

    #[error("fabric table is full")]
    TableFull,

    #[error("fabric build failed: {0}")]
    Build(#[from] FabricError),
}

pub enum FabricLifecycle {
    Idle,
    Arming(FabricBuilder),
    Committed(Arc<Fabric>),
}

impl FabricLifecycle {
    pub fn name(&self) -> &'static str {
        match self {
            FabricLifecycle::Idle => "idle",
            FabricLifecycle::Arming(_) => "arming",
            FabricLifecycle::Committed(_) => "committed",
        }
    }
}

impl std::fmt::Debug for FabricLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FabricLifecycle::Idle => f.write_str("Idle"),
            FabricLifecycle::Arming(builder) => {
                write!(f, "Arming(fabric_index = {})", builder.fabric_index())
            }
            FabricLifecycle::Committed(fabric) => f.debug_tuple("Committed").field(fabric).finish(),
        }
    }
}

/// Known fabrics, indexed by their 1-based fabric index.
#[derive(Debug)]
pub struct FabricManager {
    fabrics: BTreeMap<FabricIndex, Arc<Fabric>>,
    next_fabric_index: u8,
    lifecycle: FabricLifecycle,
}

impl FabricManager {
    pub fn new() -> Self {
        Self {
            fabrics: BTreeMap::new(),
            next_fabric_index: 1,
            lifecycle: FabricLifecycle::Idle,
        }
    }

    pub fn lifecycle(&self) -> &FabricLifecycle {
        &self.lifecycle
    }

    fn invalid(&self, operation: &'static str) -> FabricLifecycleError {
        FabricLifecycleError::InvalidTransition {
            operation,
            state: self.lifecycle.name(),
        }
    }

    /// Add an already built fabric, e.g. the controller's own.
    pub fn add_fabric(&mut self, fabric: Fabric) -> Arc<Fabric> {
        let fabric = Arc::new(fabric);
        let index = fabric.fabric_index();
        if index.0 >= self.next_fabric_index {
            self.next_fabric_index = index.0.saturating_add(1);
        }
        info!(fabric_index = %index, fabric_id = fabric.fabric_id(), node_id = fabric.node_id(), "fabric added");
        if self.fabrics.insert(index, fabric.clone()).is_some() {
            warn!(fabric_index = %index, "replaced existing fabric");
        }
        fabric
    }

    pub fn remove_fabric(&mut self, index: FabricIndex) -> Result<Arc<Fabric>, FabricLifecycleError> {
        let removed = self
            .fabrics
            .remove(&index)
            .ok_or(FabricLifecycleError::FabricNotFound(index))?;
        info!(fabric_index = %index, "fabric removed");
        Ok(removed)
    }

    pub fn fabric(&self, index: FabricIndex) -> Option<Arc<Fabric>> {
        self.fabrics.get(&index).cloned()
    }

    pub fn fabrics(&self) -> Vec<Arc<Fabric>> {
        self.fabrics.values().cloned().collect()
    }

    /// The fabric whose destination id for `initiator_random` equals
    /// `destination_id`.
    pub fn find_fabric_from_destination_id(
        &self,
        destination_id: &[u8],
        initiator_random: &[u8],
    ) -> Result<Arc<Fabric>, FabricLifecycleError> {
        for fabric in self.fabrics.values() {
            match fabric.destination_id(fabric.node_id(), initiator_random) {
                Ok(candidate) if constant_time_eq(&candidate, destination_id) => {
                    return Ok(fabric.clone());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(fabric_index = %fabric.fabric_index(), "destination id failed: {}", e);
                }
            }
        }
        Err(FabricLifecycleError::NoMatchingFabric)
    }

    /// Start commissioning a new fabric under the next free index.
    pub fn arm_fail_safe(&mut self) -> Result<&mut FabricBuilder, FabricLifecycleError> {
        if !matches!(self.lifecycle, FabricLifecycle::Idle) {
            return Err(self.invalid("arm fail-safe"));
        }
        if self.next_fabric_index == u8::MAX {
            return Err(FabricLifecycleError::TableFull);
        }
        let index = FabricIndex(self.next_fabric_index);
        debug!(fabric_index = %index, "fail-safe armed");
        self.lifecycle = FabricLifecycle::Arming(FabricBuilder::new(index));
        self.fabric_builder_mut()
    }

    pub fn fabric_builder_mut(&mut self) -> Result<&mut FabricBuilder, FabricLifecycleError> {
        let state = self.lifecycle.name();
        match &mut self.lifecycle {
            FabricLifecycle::Arming(builder) => Ok(builder),
            _ => Err(FabricLifecycleError::InvalidTransition {
                operation: "access the fabric builder",
                state,
            }),
        }
    }

    /// Build the armed fabric and add it. On failure the builder stays armed
    /// so the missing pieces can still be supplied.
    pub fn tentatively_add_fabric(&mut self) -> Result<Arc<Fabric>, FabricLifecycleError> {
        let fabric = match &self.lifecycle {
            FabricLifecycle::Arming(builder) => builder.build()?,
            _ => return Err(self.invalid("add a fabric")),
        };
        let fabric = self.add_fabric(fabric);
        self.lifecycle = FabricLifecycle::Committed(fabric.clone());
        Ok(fabric)
    }

    /// Finish commissioning and return to idle.
    pub fn complete_commission(&mut self) -> Result<Arc<Fabric>, FabricLifecycleError> {
        match std::mem::replace(&mut self.lifecycle, FabricLifecycle::Idle) {
            FabricLifecycle::Committed(fabric) => {
                info!(fabric_index = %fabric.fabric_index(), "commissioning complete");
                Ok(fabric)
            }
            other => {
                self.lifecycle = other;
                Err(self.invalid("complete commissioning"))
            }
        }
    }

    /// Fail-safe expiry: drop the builder or the tentatively added fabric.
    pub fn revert_fail_safe(&mut self) -> Result<(), FabricLifecycleError> {
        match std::mem::replace(&mut self.lifecycle, FabricLifecycle::Idle) {
            FabricLifecycle::Arming(_) => Ok(()),
            FabricLifecycle::Committed(fabric) => {
                self.fabrics.remove(&fabric.fabric_index());
                warn!(fabric_index = %fabric.fabric_index(), "fail-safe reverted, fabric dropped");
                Ok(())
            }
            FabricLifecycle::Idle => Err(self.invalid("revert fail-safe")),
        }
    }
}

impl Default for FabricManager {
    fn default() -> Self {
        Self::new()
    }
}
