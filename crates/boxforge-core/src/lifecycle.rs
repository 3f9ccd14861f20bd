//! Ephemeral step containers: create, commit, destroy.

use crate::executor::Executor;
use crate::ExecError;
use boxforge_engine::{Engine, EngineError};
use boxforge_schema::{ContainerId, Fingerprint};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Work run inside a step's container before it is committed. Returning a
/// fingerprint replaces the one the step was committed under.
pub type StepHook = dyn Fn(&Executor, &ContainerId) -> Result<Option<Fingerprint>, ExecError>;

/// Force-remove a container. A container that is already gone, or already
/// being removed, counts as destroyed.
pub fn destroy_container(engine: &dyn Engine, id: &str) -> Result<(), EngineError> {
    match engine.remove_container(id, true) {
        Ok(()) => {
            debug!("destroyed container {id}");
            Ok(())
        }
        Err(EngineError::NotFound(_)) => Ok(()),
        Err(e) if e.is_removal_in_progress() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Destroys its container on drop unless disarmed.
pub struct ContainerGuard {
    engine: Arc<dyn Engine>,
    id: ContainerId,
    armed: bool,
}

impl ContainerGuard {
    pub fn new(engine: Arc<dyn Engine>, id: ContainerId) -> Self {
        Self {
            engine,
            id,
            armed: true,
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// The container was cleaned up through the normal path.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = destroy_container(self.engine.as_ref(), &self.id) {
                warn!("failed to destroy container {}: {e}", self.id.short());
            }
        }
    }
}

impl Executor {
    /// Create a container from the current image and configuration.
    pub fn create(&self) -> Result<ContainerId, ExecError> {
        let config = self.state.container_config();
        let id = self.engine.create_container(&config)?;
        debug!("created container {} from '{}'", id.short(), config.image);
        Ok(id)
    }

    pub fn destroy(&self, id: &str) -> Result<(), ExecError> {
        Ok(destroy_container(self.engine.as_ref(), id)?)
    }

    /// Materialize one step as a new layer.
    ///
    /// The container exists only for the duration of the call: an interrupt
    /// destroys it immediately, every failure path destroys it on the way
    /// out, and the success path removes it after the commit. A failed
    /// removal after a successful commit fails the step and leaves the
    /// resulting image unchanged.
    pub fn commit(
        &mut self,
        fingerprint: &Fingerprint,
        hook: Option<&StepHook>,
    ) -> Result<(), ExecError> {
        let id = self.create()?;
        let guard = ContainerGuard::new(Arc::clone(&self.engine), id.clone());
        let _subscription = {
            let engine = Arc::clone(&self.engine);
            let id = id.clone();
            self.signals.subscribe(move || {
                if let Err(e) = destroy_container(engine.as_ref(), &id) {
                    warn!("failed to destroy container {} on interrupt: {e}", id.short());
                }
            })
        };

        let fingerprint = match hook {
            Some(hook) => hook(&*self, &id)?.unwrap_or_else(|| fingerprint.clone()),
            None => fingerprint.clone(),
        };

        let config = self.state.container_config();
        let image = self
            .engine
            .commit_container(&id, &fingerprint, &config)
            .map_err(|source| ExecError::Commit {
                container: id.clone(),
                source,
            })?;
        self.engine
            .remove_container(&id, false)
            .map_err(|source| ExecError::RemoveIntermediate {
                container: id.clone(),
                source,
            })?;
        guard.disarm();

        info!("committed '{fingerprint}' as {}", image.short());
        self.state.resulting_image = Some(image);
        Ok(())
    }

    /// [`commit`](Self::commit) with the step's command run interactively.
    pub fn commit_run(&mut self, fingerprint: &Fingerprint) -> Result<(), ExecError> {
        let hook: &StepHook = &Self::run_hook;
        self.commit(fingerprint, Some(hook))
    }
}
