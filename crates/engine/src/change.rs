use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use runway_storage::RecoveryStrategy;

use crate::lock::LockHealth;
use crate::target::TargetTransaction;

/// Static description of a change: identity, ordering and how it must be run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDescriptor {
    pub id: String,
    pub author: String,
    pub order: Option<String>,
    /// `None` means the change did not say; it is then treated as transactional.
    pub transactional: Option<bool>,
    pub target_system_id: Option<String>,
    pub recovery_strategy: RecoveryStrategy,
    pub system_change: bool,
    pub legacy: bool,
    pub class_name: String,
    pub method_name: String,
    pub metadata: serde_json::Value,
}

impl ChangeDescriptor {
    pub fn new(id: impl Into<String>, author: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            class_name: id.clone(),
            id,
            author: author.into(),
            order: None,
            transactional: None,
            target_system_id: None,
            recovery_strategy: RecoveryStrategy::ManualIntervention,
            system_change: false,
            legacy: false,
            method_name: "apply".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = Some(transactional);
        self
    }

    pub fn target_system(mut self, id: impl Into<String>) -> Self {
        self.target_system_id = Some(id.into());
        self
    }

    pub fn recovery(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery_strategy = strategy;
        self
    }

    pub fn class_name(mut self, name: impl Into<String>) -> Self {
        self.class_name = name.into();
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn system(mut self) -> Self {
        self.system_change = true;
        self
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional.unwrap_or(true)
    }
}

/// A unit of work the engine applies exactly once.
///
/// `apply` receives a [`ChangeContext`] carrying the registered
/// dependencies and, for transactional strategies, the open transaction.
#[async_trait]
pub trait Change: Send + Sync {
    fn descriptor(&self) -> &ChangeDescriptor;

    async fn apply(&self, ctx: &mut ChangeContext<'_>) -> Result<(), ChangeError>;

    /// Whether [`Change::rollback`] is implemented.
    fn has_rollback(&self) -> bool {
        false
    }

    async fn rollback(&self, _ctx: &mut ChangeContext<'_>) -> Result<(), ChangeError> {
        Err(ChangeError::msg(format!(
            "change '{}' has no rollback",
            self.descriptor().id
        )))
    }
}

/// Error returned by change code.
#[derive(Debug)]
pub struct ChangeError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
    /// Set by `new`: the wrapped error is this error, not its cause.
    transparent: bool,
}

impl ChangeError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            transparent: false,
        }
    }

    /// Wrap any error, keeping it as the source.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            source: Some(Box::new(error)),
            transparent: true,
        }
    }

    pub fn context<E>(message: impl Into<String>, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(error)),
            transparent: false,
        }
    }
}

impl fmt::Display for ChangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for ChangeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.source {
            Some(inner) if self.transparent => inner.source(),
            Some(inner) => Some(inner.as_ref()),
            None => None,
        }
    }
}

impl From<String> for ChangeError {
    fn from(message: String) -> Self {
        ChangeError::msg(message)
    }
}

impl From<&str> for ChangeError {
    fn from(message: &str) -> Self {
        ChangeError::msg(message)
    }
}

/// Values made available to change code, looked up by type or by name.
#[derive(Clone, Default)]
pub struct Dependencies {
    by_type: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    by_name: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.insert_arc(Arc::new(value))
    }

    pub fn insert_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) -> &mut Self {
        self.by_type.insert(TypeId::of::<T>(), value);
        self
    }

    pub fn insert_named<T: Send + Sync + 'static>(
        &mut self,
        name: impl Into<String>,
        value: Arc<T>,
    ) -> &mut Self {
        self.by_name.insert(name.into(), value);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|v| v.clone().downcast::<T>().ok())
    }

    pub fn get_named<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.by_name
            .get(name)
            .and_then(|v| v.clone().downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.by_type.len() + self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field("by_type", &self.by_type.len())
            .field("by_name", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What change code sees while it runs.
///
/// Dependency lookups fail once the run has lost its lock, so a change
/// cannot touch shared resources without it.
pub struct ChangeContext<'a> {
    change_id: &'a str,
    stage_id: &'a str,
    execution_id: &'a str,
    dependencies: &'a Dependencies,
    lock: &'a LockHealth,
    transaction: Option<&'a mut (dyn TargetTransaction + 'static)>,
}

impl<'a> ChangeContext<'a> {
    pub(crate) fn new(
        change_id: &'a str,
        stage_id: &'a str,
        execution_id: &'a str,
        dependencies: &'a Dependencies,
        lock: &'a LockHealth,
        transaction: Option<&'a mut (dyn TargetTransaction + 'static)>,
    ) -> Self {
        Self {
            change_id,
            stage_id,
            execution_id,
            dependencies,
            lock,
            transaction,
        }
    }

    pub fn change_id(&self) -> &str {
        self.change_id
    }

    pub fn stage_id(&self) -> &str {
        self.stage_id
    }

    pub fn execution_id(&self) -> &str {
        self.execution_id
    }

    pub fn dependency<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ChangeError> {
        self.lock.ensure_held().map_err(ChangeError::new)?;
        self.dependencies.get::<T>().ok_or_else(|| {
            ChangeError::msg(format!(
                "no dependency of type {} registered",
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn named_dependency<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, ChangeError> {
        self.lock.ensure_held().map_err(ChangeError::new)?;
        self.dependencies
            .get_named::<T>(name)
            .ok_or_else(|| ChangeError::msg(format!("no dependency named '{name}' registered")))
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// The open transaction, downcast to the target system's concrete type.
    pub fn transaction<T: TargetTransaction>(&mut self) -> Option<&mut T> {
        self.transaction
            .as_deref_mut()
            .and_then(|tx| tx.as_any_mut().downcast_mut::<T>())
    }
}
