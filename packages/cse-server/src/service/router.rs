//! Controller routing: maps a resource type to the controller that owns its
//! lifecycle rules.

use std::collections::HashMap;
use std::sync::Arc;

use cse_core::{CseError, CseResult, ResourceType};

use super::domain::controllers::{
    AccessControlPolicyController, AeController, AnnouncedController, ContainerController,
    ContentInstanceController, Controller, CseBaseController, RemoteCseController,
    SubscriptionController,
};

// ---------------------------------------------------------------------------
// ControllerRegistry
// ---------------------------------------------------------------------------

/// Routes resource types to their controllers.
///
/// Built once at startup and injected into the Method Domain. Requests for a
/// type without a controller fail with `NotImplemented`.
pub struct ControllerRegistry {
    controllers: HashMap<ResourceType, Arc<dyn Controller>>,
}

impl ControllerRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            controllers: HashMap::new(),
        }
    }

    /// Registry holding a controller for every hosted resource type.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(AccessControlPolicyController);
        registry.register(AeController);
        registry.register(ContainerController);
        registry.register(ContentInstanceController);
        registry.register(CseBaseController);
        registry.register(RemoteCseController);
        registry.register(SubscriptionController);
        for ty in [
            ResourceType::AccessControlPolicyAnnc,
            ResourceType::AeAnnc,
            ResourceType::ContainerAnnc,
        ] {
            registry.register(AnnouncedController::new(ty));
        }
        registry
    }

    /// Register a controller under its own resource type, replacing any
    /// previous one.
    pub fn register<C: Controller + 'static>(&mut self, controller: C) {
        self.controllers
            .insert(controller.resource_type(), Arc::new(controller));
    }

    /// Controller for `ty`.
    ///
    /// # Errors
    ///
    /// `NotImplemented` when no controller is registered.
    pub fn get(&self, ty: ResourceType) -> CseResult<Arc<dyn Controller>> {
        self.controllers
            .get(&ty)
            .cloned()
            .ok_or_else(|| CseError::NotImplemented(format!("resource type {ty}")))
    }

    #[must_use]
    pub fn supported_types(&self) -> Vec<ResourceType> {
        let mut types: Vec<_> = self.controllers.keys().copied().collect();
        types.sort();
        types
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
