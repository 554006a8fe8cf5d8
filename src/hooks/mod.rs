pub mod patch;
pub mod script;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::webhook::review::{AdmissionRequest, Operation};

pub use self::patch::PatchOperation;
pub use self::script::ScriptHook;

/// Decision for one admission request.
///
/// A denied result never carries patch operations, and a result with patch
/// operations is always allowed. The constructors are the only way to build
/// one.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionResult {
    allowed: bool,
    message: Option<String>,
    patch: Vec<PatchOperation>,
}

impl AdmissionResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
            patch: Vec::new(),
        }
    }

    pub fn allow_with_patch(patch: Vec<PatchOperation>) -> Self {
        Self {
            allowed: true,
            message: None,
            patch,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: Some(message.into()),
            patch: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn patch(&self) -> &[PatchOperation] {
        &self.patch
    }
}

/// Admission logic bound to an operation.
///
/// The webhook calls `execute()` once per matching request. An `Err` fails
/// that request with a 500; it is never turned into a deny.
#[async_trait]
pub trait AdmissionHook: Send + Sync {
    /// Used in log lines.
    fn name(&self) -> &str;

    async fn execute(&self, request: &AdmissionRequest) -> anyhow::Result<AdmissionResult>;
}

/// One optional hook per mutable operation.
///
/// `CONNECT` and unknown operations have no slot; like unbound slots they
/// resolve to `AdmissionResult::allow()`.
#[derive(Default, Clone)]
pub struct HookTable {
    create: Option<Arc<dyn AdmissionHook>>,
    update: Option<Arc<dyn AdmissionHook>>,
    delete: Option<Arc<dyn AdmissionHook>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `hook` to `operation`, replacing any previous binding.
    pub fn bind(&mut self, operation: Operation, hook: Arc<dyn AdmissionHook>) -> anyhow::Result<()> {
        let slot = match operation {
            Operation::Create => &mut self.create,
            Operation::Update => &mut self.update,
            Operation::Delete => &mut self.delete,
            Operation::Connect | Operation::Other => {
                anyhow::bail!("hooks cannot be bound to {operation}")
            }
        };
        *slot = Some(hook);
        Ok(())
    }

    pub fn get(&self, operation: Operation) -> Option<&Arc<dyn AdmissionHook>> {
        match operation {
            Operation::Create => self.create.as_ref(),
            Operation::Update => self.update.as_ref(),
            Operation::Delete => self.delete.as_ref(),
            Operation::Connect | Operation::Other => None,
        }
    }

    pub async fn dispatch(&self, request: &AdmissionRequest) -> anyhow::Result<AdmissionResult> {
        match self.get(request.operation) {
            Some(hook) => {
                debug!(
                    hook = hook.name(),
                    operation = %request.operation,
                    target = %request.target(),
                    "Dispatching admission request"
                );
                hook.execute(request).await
            }
            None => Ok(AdmissionResult::allow()),
        }
    }

    pub fn bound_operations(&self) -> Vec<Operation> {
        [Operation::Create, Operation::Update, Operation::Delete]
            .into_iter()
            .filter(|op| self.get(*op).is_some())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bound_operations().is_empty()
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTable")
            .field("bound", &self.bound_operations())
            .finish()
    }
}
