//! Object factory.
//!
//! A context holds what objects share: the algorithm registry, the
//! engine defaults and the fault controller. Objects copy the defaults at
//! creation and keep an `Arc` to the rest, so a context can be dropped
//! while its objects live on.

use std::sync::Arc;

use crate::config::{ConfigError, EngineConfig};
use crate::envelope::{Envelope, EnvelopeMode};
use crate::error::Result;
use crate::fault::FaultController;
use crate::registry::Registry;
use crate::session::{Role, Session};
use crate::transport::Transport;

/// Shared registry, defaults and fault controller.
#[derive(Debug, Clone, Default)]
pub struct Context {
    registry: Arc<Registry>,
    config: EngineConfig,
    faults: Arc<FaultController>,
}

impl Context {
    /// Builtin registry and default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with validated defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a value is out of range.
    pub fn with_config(config: EngineConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    /// Replace the registry.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Share a fault controller with every object created from here on.
    pub fn with_faults(mut self, faults: Arc<FaultController>) -> Self {
        self.faults = faults;
        self
    }

    /// Algorithm registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Engine defaults.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fault controller handed to new objects.
    pub fn faults(&self) -> &Arc<FaultController> {
        &self.faults
    }

    /// New envelope.
    pub fn create_envelope(&self, mode: EnvelopeMode) -> Result<Envelope> {
        tracing::debug!(?mode, "creating envelope");
        Envelope::new(
            mode,
            &self.config,
            Arc::clone(&self.registry),
            Arc::clone(&self.faults),
        )
    }

    /// New session speaking over `transport`.
    pub fn create_session(&self, role: Role, transport: impl Transport + 'static) -> Result<Session> {
        self.create_session_boxed(role, Box::new(transport))
    }

    pub(crate) fn create_session_boxed(
        &self,
        role: Role,
        transport: Box<dyn Transport>,
    ) -> Result<Session> {
        tracing::debug!(?role, "creating session");
        Session::new(
            role,
            &self.config,
            Arc::clone(&self.registry),
            Arc::clone(&self.faults),
            transport,
        )
    }
}
