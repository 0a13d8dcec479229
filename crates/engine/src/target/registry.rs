use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use super::{NoOpTargetSystem, TargetSystem};
use crate::error::TargetSystemResolutionError;

/// Target systems known to a run, keyed by id, plus the default used for
/// changes that name none.
#[derive(Clone)]
pub struct TargetSystemRegistry {
    systems: BTreeMap<String, Arc<dyn TargetSystem>>,
    default: Arc<dyn TargetSystem>,
    strict: bool,
}

impl TargetSystemRegistry {
    pub fn new(strict: bool) -> Self {
        Self {
            systems: BTreeMap::new(),
            default: Arc::new(NoOpTargetSystem::default()),
            strict,
        }
    }

    pub fn register(&mut self, system: Arc<dyn TargetSystem>) -> &mut Self {
        self.systems.insert(system.id().to_string(), system);
        self
    }

    /// Replace the default target system. It also becomes resolvable by its id.
    pub fn set_default(&mut self, system: Arc<dyn TargetSystem>) -> &mut Self {
        self.systems.insert(system.id().to_string(), system.clone());
        self.default = system;
        self
    }

    pub fn set_strict(&mut self, strict: bool) -> &mut Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn default_system(&self) -> Arc<dyn TargetSystem> {
        self.default.clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.systems.keys().cloned().collect()
    }

    /// Every registered system, the default included.
    pub fn systems(&self) -> Vec<Arc<dyn TargetSystem>> {
        let mut all: Vec<_> = self.systems.values().cloned().collect();
        if !self.systems.contains_key(self.default.id()) {
            all.push(self.default.clone());
        }
        all
    }

    /// Resolve the target system for `change_id`.
    ///
    /// An unknown id fails in strict mode and falls back to the default,
    /// with a warning, otherwise.
    pub fn resolve(
        &self,
        change_id: &str,
        target_system_id: Option<&str>,
    ) -> Result<Arc<dyn TargetSystem>, TargetSystemResolutionError> {
        let Some(id) = target_system_id else {
            return Ok(self.default.clone());
        };
        if let Some(system) = self.systems.get(id) {
            return Ok(system.clone());
        }
        if id == self.default.id() {
            return Ok(self.default.clone());
        }
        if self.strict {
            return Err(TargetSystemResolutionError {
                change_id: change_id.to_string(),
                target_system_id: id.to_string(),
                available: self.ids(),
                suggestion: format!(
                    "register a target system with id '{id}', or disable strict target system resolution"
                ),
            });
        }
        warn!(
            change_id,
            target_system = id,
            default = self.default.id(),
            "unknown target system; using the default"
        );
        Ok(self.default.clone())
    }
}

impl Default for TargetSystemRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}
