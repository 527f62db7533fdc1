//! Model instance registry: one loaded model per shared instance id.
//!
//! Stages register intent first (`register`), naming the instance id and,
//! for exactly one of them, the model configuration.  The first stage to
//! supply a configuration becomes the master; every other stage is a slave
//! and inherits the master's configuration through the built instance.
//! The model is built once, on the first `acquire`, from the master's
//! configuration, and unloaded when the last registrant releases it.
//!
//! All state sits behind one mutex.  The factory runs inside that critical
//! section, so concurrent first acquires cannot load the model twice.  The
//! last release keeps the entry in an unloading state until the engine has
//! shut down; an `acquire` arriving meanwhile waits, so a shared id never has
//! two live instances.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use vinfer_core::backend::CompletionHandler;
use vinfer_core::error::{EngineError, Result};

use crate::dispatcher::{CompletionDispatcher, ResultHandle};
use crate::model::{ModelConfig, ModelFactory, ModelInstance};

/// Role a stage plays for its instance id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Supplied the authoritative configuration.
    Master,
    /// Inherits the master's configuration.
    Slave,
}

#[derive(Default)]
struct RegistryEntry {
    refcount: usize,
    master: Option<String>,
    config: Option<Arc<ModelConfig>>,
    /// Slaves that have not yet been bound to a built instance.
    uninitialized: Vec<String>,
    members: Vec<String>,
    instance: Option<Arc<ModelInstance>>,
    /// Previous instance is still shutting down.
    unloading: bool,
}

/// Shared registry of model instances.  Create one and hand an `Arc` to
/// every stage.
pub struct ModelRegistry {
    factory: Arc<dyn ModelFactory>,
    handler: Arc<dyn CompletionHandler<ResultHandle>>,
    entries: Mutex<HashMap<String, RegistryEntry>>,
    unloaded: Condvar,
}

impl ModelRegistry {
    pub fn new(factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            factory,
            handler: Arc::new(CompletionDispatcher::new()),
            entries: Mutex::new(HashMap::new()),
            unloaded: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Associate `element` with `instance_id`.
    ///
    /// The first element supplying a configuration while no master exists
    /// becomes master.  A later, different configuration is ignored with a
    /// warning.
    pub fn register(
        &self,
        element: &str,
        instance_id: &str,
        config: Option<ModelConfig>,
    ) -> Result<Role> {
        let mut entries = self.lock();
        let entry = entries.entry(instance_id.to_string()).or_default();
        if entry.members.iter().any(|m| m == element) {
            return Err(EngineError::DuplicateRegistration {
                element: element.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        entry.members.push(element.to_string());
        entry.refcount += 1;

        let role = match config {
            Some(config) if entry.config.is_none() => {
                entry.master = Some(element.to_string());
                entry.config = Some(Arc::new(config));
                Role::Master
            }
            Some(config) => {
                if entry.config.as_deref() != Some(&config) {
                    warn!(
                        element,
                        instance_id,
                        master = entry.master.as_deref().unwrap_or("?"),
                        "Ignoring model configuration; instance already has a master"
                    );
                }
                Role::Slave
            }
            None => Role::Slave,
        };
        if role == Role::Slave && entry.instance.is_none() {
            entry.uninitialized.push(element.to_string());
        }
        debug!(element, instance_id, ?role, refcount = entry.refcount, "Registered");
        Ok(role)
    }

    /// Get the loaded instance for `instance_id`, building it on first use.
    ///
    /// Blocks while a previous instance for the id is still unloading.
    pub fn acquire(&self, element: &str, instance_id: &str) -> Result<Arc<ModelInstance>> {
        let mut entries = self
            .unloaded
            .wait_while(self.lock(), |entries| {
                entries.get(instance_id).is_some_and(|e| e.unloading)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = entries
            .get_mut(instance_id)
            .filter(|e| e.members.iter().any(|m| m == element))
            .ok_or_else(|| EngineError::UnknownElement {
                element: element.to_string(),
                instance_id: instance_id.to_string(),
            })?;

        if let Some(instance) = &entry.instance {
            return Ok(Arc::clone(instance));
        }
        let Some(config) = entry.config.clone() else {
            return Err(EngineError::MissingMasterConfig {
                instance_id: instance_id.to_string(),
            });
        };

        let instance = self
            .factory
            .build(instance_id, config, Arc::clone(&self.handler))
            .map_err(|e| match e {
                EngineError::ModelLoad { .. } => e,
                other => EngineError::ModelLoad {
                    instance_id: instance_id.to_string(),
                    message: other.chain(),
                },
            })?;
        let instance = Arc::new(instance);
        entry.instance = Some(Arc::clone(&instance));
        let bound = std::mem::take(&mut entry.uninitialized);
        info!(
            instance_id,
            master = entry.master.as_deref().unwrap_or("?"),
            slaves = bound.len(),
            "Model instance ready"
        );
        Ok(instance)
    }

    /// Drop `element`'s reference.  The last release unloads the model.
    pub fn release(&self, element: &str, instance_id: &str) -> Result<()> {
        let unloaded = {
            let mut entries = self.lock();
            let unknown = || EngineError::UnknownElement {
                element: element.to_string(),
                instance_id: instance_id.to_string(),
            };
            let entry = entries.get_mut(instance_id).ok_or_else(unknown)?;
            let position = entry
                .members
                .iter()
                .position(|m| m == element)
                .ok_or_else(unknown)?;
            entry.members.remove(position);
            entry.uninitialized.retain(|m| m != element);
            entry.refcount -= 1;
            if entry.master.as_deref() == Some(element) {
                entry.master = None;
            }
            debug!(element, instance_id, refcount = entry.refcount, "Released");
            if entry.refcount > 0 {
                return Ok(());
            }
            // A later registrant starts from a clean entry and may supply a
            // new master configuration.
            entry.config = None;
            match entry.instance.take() {
                Some(instance) => {
                    entry.unloading = true;
                    instance
                }
                // The unloader removes the entry once shutdown returns.
                None if entry.unloading => return Ok(()),
                None => {
                    entries.remove(instance_id);
                    return Ok(());
                }
            }
        };

        // Engine shutdown joins worker threads; keep it outside the lock.
        unloaded.engine.shutdown();
        drop(unloaded);
        info!(instance_id, "Model instance unloaded");

        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(instance_id) {
            entry.unloading = false;
            if entry.refcount == 0 {
                entries.remove(instance_id);
            }
        }
        self.unloaded.notify_all();
        Ok(())
    }

    /// Number of registered elements for `instance_id`.
    pub fn refcount(&self, instance_id: &str) -> usize {
        self.lock().get(instance_id).map_or(0, |e| e.refcount)
    }

    pub fn is_loaded(&self, instance_id: &str) -> bool {
        self.lock()
            .get(instance_id)
            .is_some_and(|e| e.instance.is_some())
    }

    /// Registered element that supplied the configuration for `instance_id`.
    /// `None` once that element has released, even while slaves keep the
    /// instance alive.
    pub fn master(&self, instance_id: &str) -> Option<String> {
        self.lock().get(instance_id).and_then(|e| e.master.clone())
    }

    /// Slaves still waiting for the instance to be built.
    pub fn uninitialized(&self, instance_id: &str) -> Vec<String> {
        self.lock()
            .get(instance_id)
            .map(|e| e.uninitialized.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vinfer_core::backend::{IdentityPreProcessor, InferenceEngine, NoopPostProcessor, PreProcessor};
    use vinfer_core::types::ImageView;

    struct IdleEngine;

    impl InferenceEngine<ResultHandle> for IdleEngine {
        fn submit_image(&self, _: ImageView, _: ResultHandle, _: &Arc<dyn PreProcessor>) -> Result<()> {
            Ok(())
        }
        fn try_submit_image(&self, _: ImageView, _: ResultHandle, _: &Arc<dyn PreProcessor>) -> Result<()> {
            Ok(())
        }
        fn is_queue_full(&self) -> bool {
            false
        }
        fn flush(&self) {}
        fn shutdown(&self) {}
        fn name(&self) -> &str {
            "idle"
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        loads: AtomicUsize,
    }

    impl ModelFactory for CountingFactory {
        fn build(
            &self,
            instance_id: &str,
            config: Arc<ModelConfig>,
            _handler: Arc<dyn CompletionHandler<ResultHandle>>,
        ) -> Result<ModelInstance> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(ModelInstance {
                instance_id: instance_id.to_string(),
                name: config.model_name(),
                config,
                engine: Arc::new(IdleEngine),
                preprocess: Arc::new(IdentityPreProcessor),
                postprocess: Arc::new(NoopPostProcessor),
            })
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ModelRegistry::new(Arc::new(CountingFactory::default()));
        registry.register("a", "cam1", None).expect("first");
        let err = registry
            .register("a", "cam1", None)
            .expect_err("same element twice");
        assert_eq!(err.error_code(), 103);
        assert_eq!(registry.refcount("cam1"), 1);
    }

    #[test]
    fn second_configuration_does_not_replace_master() {
        let registry = ModelRegistry::new(Arc::new(CountingFactory::default()));
        assert_eq!(
            registry
                .register("a", "cam1", Some(ModelConfig::new("p.xml")))
                .expect("a"),
            Role::Master
        );
        assert_eq!(
            registry
                .register("b", "cam1", Some(ModelConfig::new("q.xml")))
                .expect("b"),
            Role::Slave
        );
        assert_eq!(registry.master("cam1").as_deref(), Some("a"));
        let model = registry.acquire("b", "cam1").expect("built from a");
        assert_eq!(model.name, "p");
    }

    #[test]
    fn acquire_without_master_fails() {
        let registry = ModelRegistry::new(Arc::new(CountingFactory::default()));
        registry.register("a", "cam1", None).expect("a");
        let err = registry.acquire("a", "cam1").expect_err("no config");
        assert!(matches!(err, EngineError::MissingMasterConfig { .. }));
        assert_eq!(registry.uninitialized("cam1"), vec!["a".to_string()]);
    }

    #[test]
    fn release_of_unknown_element_fails() {
        let registry = ModelRegistry::new(Arc::new(CountingFactory::default()));
        registry.register("a", "cam1", None).expect("a");
        let err = registry.release("b", "cam1").expect_err("b never registered");
        assert_eq!(err.error_code(), 104);
        let err = registry.release("a", "cam2").expect_err("unknown id");
        assert_eq!(err.error_code(), 104);
    }

    #[test]
    fn slaves_bind_on_first_acquire() {
        let factory = Arc::new(CountingFactory::default());
        let registry = ModelRegistry::new(factory.clone());
        registry.register("a", "cam1", None).expect("a");
        registry
            .register("b", "cam1", Some(ModelConfig::new("p.xml")))
            .expect("b");
        assert_eq!(registry.uninitialized("cam1").len(), 1);
        registry.acquire("a", "cam1").expect("build");
        registry.acquire("b", "cam1").expect("reuse");
        assert!(registry.uninitialized("cam1").is_empty());
        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);
    }
}
