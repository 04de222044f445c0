use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};

use super::backend::Embedder;

type EmbedderFactory = Box<dyn Fn() -> Result<Box<dyn Embedder>> + Send + Sync>;

/// Registry of embedder backends by name.
///
/// Backends are registered as factories: the recognition worker and the roster
/// loader each build their own instance, so no embedder is shared across threads.
pub struct EmbedderRegistry {
    factories: HashMap<String, EmbedderFactory>,
    default_name: Option<String>,
}

impl EmbedderRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the backends compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("cpu", || Ok(Box::new(super::CpuEmbedder::new())));
        registry.register("stub", || Ok(Box::new(super::StubEmbedder::new())));
        registry
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn Embedder>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("embedder '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Build a fresh instance of a named backend and warm it up.
    pub fn create(&self, name: &str) -> Result<Box<dyn Embedder>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("embedder '{}' not registered", name))?;
        let mut embedder = factory()?;
        embedder
            .warm_up()
            .with_context(|| format!("embedder '{}' failed to warm up", name))?;
        Ok(embedder)
    }

    /// Build a fresh instance of the default backend.
    pub fn create_default(&self) -> Result<Box<dyn Embedder>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no embedder registered"))?;
        self.create(name)
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for EmbedderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbedError;
    use crate::{BoundingBox, Vector};
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct WarmUpCounter {
        warmed: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Embedder for WarmUpCounter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn detect_faces(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>> {
            Ok(Vec::new())
        }

        fn encode(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<Vector, EmbedError> {
            Err(EmbedError::NoFaceDetected)
        }

        fn warm_up(&mut self) -> Result<()> {
            self.warmed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("model not ready"));
            }
            Ok(())
        }
    }

    #[test]
    fn first_registered_is_default() -> Result<()> {
        let registry = EmbedderRegistry::with_builtin();
        assert_eq!(registry.create_default()?.name(), "cpu");
        assert_eq!(registry.list(), vec!["cpu".to_string(), "stub".to_string()]);
        Ok(())
    }

    #[test]
    fn default_can_be_switched() -> Result<()> {
        let mut registry = EmbedderRegistry::with_builtin();
        registry.set_default("stub")?;
        assert_eq!(registry.create_default()?.name(), "stub");
        assert!(registry.set_default("missing").is_err());
        assert!(registry.create("missing").is_err());
        Ok(())
    }

    #[test]
    fn every_instance_is_warmed_up() -> Result<()> {
        let warmed = Arc::new(AtomicUsize::new(0));
        let mut registry = EmbedderRegistry::new();
        let counter = Arc::clone(&warmed);
        registry.register("counter", move || {
            Ok(Box::new(WarmUpCounter {
                warmed: Arc::clone(&counter),
                fail: false,
            }))
        });

        registry.create_default()?;
        registry.create("counter")?;
        assert_eq!(warmed.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn failed_warm_up_fails_creation() {
        let warmed = Arc::new(AtomicUsize::new(0));
        let mut registry = EmbedderRegistry::new();
        let counter = Arc::clone(&warmed);
        registry.register("cold", move || {
            Ok(Box::new(WarmUpCounter {
                warmed: Arc::clone(&counter),
                fail: true,
            }))
        });

        let err = registry.create_default().err().expect("warm-up error");
        assert!(err.to_string().contains("cold"));
        assert_eq!(warmed.load(Ordering::SeqCst), 1);
    }
}
