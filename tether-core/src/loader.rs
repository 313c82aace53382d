//! Module-loading capability for shared worker plugins.
//!
//! A plugin is identified by its file name. Loading resolves that name to a
//! factory which the shared worker entry invokes exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture};

use crate::worker::FactoryOptions;

/// Entry point of a shared worker plugin.
///
/// The returned future runs on the shared worker's single-threaded loop for
/// as long as the plugin wants; it must call
/// [`FactoryOptions::negotiate_protocol`] before doing anything else.
pub trait SharedWorkerFactory: Send + Sync {
    fn create(&self, options: FactoryOptions) -> LocalBoxFuture<'static, Result<()>>;
}

impl<F, Fut> SharedWorkerFactory for F
where
    F: Fn(FactoryOptions) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + 'static,
{
    fn create(&self, options: FactoryOptions) -> LocalBoxFuture<'static, Result<()>> {
        self(options).boxed_local()
    }
}

#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Resolves a plugin file to its factory, or fails.
    async fn load(&self, filename: &Path) -> Result<Arc<dyn SharedWorkerFactory>>;
}

/// Plugins compiled into the running binary, keyed by file name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<PathBuf, Arc<dyn SharedWorkerFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        filename: impl Into<PathBuf>,
        factory: impl SharedWorkerFactory + 'static,
    ) -> Self {
        self.factories.insert(filename.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, filename: &Path) -> bool {
        self.factories.contains_key(filename)
    }
}

#[async_trait]
impl PluginLoader for PluginRegistry {
    async fn load(&self, filename: &Path) -> Result<Arc<dyn SharedWorkerFactory>> {
        let Some(factory) = self.factories.get(filename) else {
            bail!("no shared worker plugin registered for {}", filename.display())
        };
        Ok(factory.clone())
    }
}
