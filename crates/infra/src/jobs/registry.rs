//! Explicit handler registry.
//!
//! Handlers are registered at startup under a stable [`HandlerId`]; jobs name
//! their handler by that id and an unknown id is a typed error.

use std::collections::BTreeMap;
use std::sync::Arc;

use syncwarden_core::{DataConsistency, HandlerConfig, HandlerId, JobId, Resource};

use super::types::JobArgs;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown job handler: {0}")]
    UnknownHandler(String),
    #[error("handler already registered: {0}")]
    DuplicateHandler(HandlerId),
    #[error("invalid handler configuration: {0}")]
    InvalidConfig(String),
}

/// What a handler sees while performing a job.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub job_id: &'a JobId,
    pub handler: &'a HandlerId,
    pub consistency: DataConsistency,
    /// The claimed resource, as read with `consistency`. `None` for jobs
    /// not bound to a resource.
    pub resource: Option<&'a Resource>,
}

/// An idempotent unit of work.
///
/// `perform` may run more than once for the same arguments (at-least-once
/// delivery); running it again must converge to the same result.
pub trait JobHandler: Send + Sync {
    fn perform(&self, ctx: &JobContext<'_>, args: &JobArgs) -> anyhow::Result<()>;

    /// Normalize the payload before deriving the dedup key. Handlers whose
    /// arguments contain order-insensitive collections override this so that
    /// equivalent submissions collide.
    fn normalize_payload(&self, payload: &serde_json::Value) -> serde_json::Value {
        payload.clone()
    }
}

/// Adapter turning a closure into a [`JobHandler`]; see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap a closure as a handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&JobContext<'_>, &JobArgs) -> anyhow::Result<()> + Send + Sync,
{
    FnHandler(f)
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JobContext<'_>, &JobArgs) -> anyhow::Result<()> + Send + Sync,
{
    fn perform(&self, ctx: &JobContext<'_>, args: &JobArgs) -> anyhow::Result<()> {
        (self.0)(ctx, args)
    }
}

/// A handler plus its per-type settings.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub id: HandlerId,
    pub handler: Arc<dyn JobHandler>,
    pub config: HandlerConfig,
}

impl core::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<HandlerId, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(
        &mut self,
        id: HandlerId,
        handler: H,
        config: HandlerConfig,
    ) -> Result<(), RegistryError>
    where
        H: JobHandler + 'static,
    {
        if self.handlers.contains_key(&id) {
            return Err(RegistryError::DuplicateHandler(id));
        }
        config
            .validate(&id)
            .map_err(|e| RegistryError::InvalidConfig(e.to_string()))?;

        self.handlers.insert(
            id.clone(),
            RegisteredHandler {
                id,
                handler: Arc::new(handler),
                config,
            },
        );
        Ok(())
    }

    pub fn resolve(&self, id: &str) -> Result<&RegisteredHandler, RegistryError> {
        self.handlers
            .iter()
            .find(|(key, _)| key.as_str() == id)
            .map(|(_, registered)| registered)
            .ok_or_else(|| RegistryError::UnknownHandler(id.to_string()))
    }

    pub fn get(&self, id: &HandlerId) -> Option<&RegisteredHandler> {
        self.handlers.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &HandlerId> {
        self.handlers.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredHandler> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
