//! Name-unique, two-tier module registry.
//!
//! Modules are registered into either the default tier (framework-provided) or the user tier.
//! Duplicate names are rejected per tier at registration time; collisions *across* tiers are
//! only detected when the tiers are merged, which happens exactly once at launch.

use std::sync::Arc;

use crate::contracts::{Module, ModuleTier};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("module name must not be empty")]
    InvalidName,

    #[error("module '{name}' is already registered in the {tier} tier")]
    DuplicateName { name: String, tier: ModuleTier },

    #[error("module instance is already registered as '{existing}'")]
    DuplicateInstance { existing: String },

    #[error("module '{name}' is registered in both the default and the user tier")]
    NameCollision { name: String },

    #[error("registry is sealed; modules cannot be registered after launch")]
    Sealed,
}

impl RegistryError {
    /// Every registry error is a misuse of the API rather than a runtime condition.
    #[must_use]
    pub fn is_programming_error(&self) -> bool {
        true
    }
}

/// One registered module.
#[derive(Clone)]
pub struct ModuleRecord {
    pub name: Arc<str>,
    pub tier: ModuleTier,
    pub module: Arc<dyn Module>,
    /// Names of the sub-commands this module bound.
    pub commands: Vec<String>,
}

impl std::fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ModuleRegistry {
    default_tier: Vec<ModuleRecord>,
    user_tier: Vec<ModuleRecord>,
    merged: Option<Vec<ModuleRecord>>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module to `tier` under `name`.
    ///
    /// # Errors
    /// `InvalidName` for an empty name, `DuplicateName` when the tier already has `name`,
    /// `DuplicateInstance` when the same instance is registered anywhere, `Sealed` after merge.
    pub fn register(
        &mut self,
        tier: ModuleTier,
        name: &str,
        module: Arc<dyn Module>,
    ) -> Result<(), RegistryError> {
        if self.merged.is_some() {
            return Err(RegistryError::Sealed);
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidName);
        }

        let ptr = instance_ptr(&module);
        if let Some(existing) = self
            .default_tier
            .iter()
            .chain(self.user_tier.iter())
            .find(|r| instance_ptr(&r.module) == ptr)
        {
            return Err(RegistryError::DuplicateInstance {
                existing: existing.name.to_string(),
            });
        }

        let records = match tier {
            ModuleTier::Default => &mut self.default_tier,
            ModuleTier::User => &mut self.user_tier,
        };
        if records.iter().any(|r| &*r.name == name) {
            return Err(RegistryError::DuplicateName {
                name: name.to_owned(),
                tier,
            });
        }

        tracing::debug!(module = name, %tier, "module registered");
        records.push(ModuleRecord {
            name: Arc::from(name),
            tier,
            module,
            commands: Vec::new(),
        });
        Ok(())
    }

    /// Merge both tiers into the launch order: default tier first, each in registration order.
    ///
    /// Runs once; later calls return the already merged view.
    ///
    /// # Errors
    /// `NameCollision` if a user-tier module reuses a default-tier name.
    pub fn merge_tiers(&mut self) -> Result<&[ModuleRecord], RegistryError> {
        if self.merged.is_none() {
            if let Some(clash) = self
                .user_tier
                .iter()
                .find(|u| self.default_tier.iter().any(|d| d.name == u.name))
            {
                return Err(RegistryError::NameCollision {
                    name: clash.name.to_string(),
                });
            }

            let mut merged = Vec::with_capacity(self.default_tier.len() + self.user_tier.len());
            merged.extend(self.default_tier.iter().cloned());
            merged.extend(self.user_tier.iter().cloned());
            self.merged = Some(merged);
        }
        Ok(self.merged.as_deref().unwrap_or_default())
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.merged.is_some()
    }

    /// Launch-ordered records; empty until merged.
    #[must_use]
    pub fn modules(&self) -> &[ModuleRecord] {
        self.merged.as_deref().unwrap_or_default()
    }

    pub(crate) fn record_commands(&mut self, name: &str, commands: Vec<String>) {
        if let Some(rec) = self
            .merged
            .as_mut()
            .and_then(|m| m.iter_mut().find(|r| &*r.name == name))
        {
            rec.commands = commands;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.default_tier.len() + self.user_tier.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn instance_ptr(module: &Arc<dyn Module>) -> *const () {
    Arc::as_ptr(module).cast::<()>()
}

/// Registration name derived from a type: the last path segment, generics stripped.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
