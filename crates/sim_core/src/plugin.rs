//! Plugins: cloneable configuration bundles that register components.
//!
//! A plugin carries typed data (its configuration) and an initializer that
//! registers the plugin's actors, data managers and resolvers. Experiments
//! clone plugins per scenario and mutate their data before initialization.

use std::any::{type_name, Any};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::Context;
use crate::error::KernelError;
use crate::registry::{dependency_order, ComponentId, ComponentRegistry};

/// Configuration carried by a plugin.
pub trait PluginData: Any + Send + Sync + fmt::Debug {
    fn clone_data(&self) -> Box<dyn PluginData>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Clone + Send + Sync + fmt::Debug> PluginData for T {
    fn clone_data(&self) -> Box<dyn PluginData> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId(Cow<'static, str>);

impl PluginId {
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for PluginId {
    fn from(id: &'static str) -> Self {
        Self::from_static(id)
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Initializer = Arc<dyn Fn(&mut PluginContext<'_>) -> Result<(), KernelError> + Send + Sync>;

pub struct Plugin {
    id: PluginId,
    dependencies: Vec<PluginId>,
    data: Vec<Box<dyn PluginData>>,
    initializer: Initializer,
}

impl Plugin {
    pub fn builder(id: impl Into<PluginId>) -> PluginBuilder {
        PluginBuilder {
            id: id.into(),
            dependencies: Vec::new(),
            data: Vec::new(),
            initializer: None,
        }
    }

    pub fn id(&self) -> &PluginId {
        &self.id
    }

    pub fn dependencies(&self) -> &[PluginId] {
        &self.dependencies
    }

    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data
            .iter()
            .find_map(|data| (**data).as_any().downcast_ref::<T>())
    }

    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data
            .iter_mut()
            .find_map(|data| (**data).as_any_mut().downcast_mut::<T>())
    }
}

impl Clone for Plugin {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            dependencies: self.dependencies.clone(),
            data: self.data.iter().map(|data| (**data).clone_data()).collect(),
            initializer: Arc::clone(&self.initializer),
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

pub struct PluginBuilder {
    id: PluginId,
    dependencies: Vec<PluginId>,
    data: Vec<Box<dyn PluginData>>,
    initializer: Option<Initializer>,
}

impl PluginBuilder {
    pub fn depends_on(mut self, plugin: impl Into<PluginId>) -> Self {
        self.dependencies.push(plugin.into());
        self
    }

    pub fn with_data<T: PluginData>(mut self, data: T) -> Self {
        self.data.push(Box::new(data));
        self
    }

    pub fn with_initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&mut PluginContext<'_>) -> Result<(), KernelError> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    pub fn build(self) -> Plugin {
        Plugin {
            id: self.id,
            dependencies: self.dependencies,
            data: self.data,
            initializer: self
                .initializer
                .unwrap_or_else(|| Arc::new(no_initializer)),
        }
    }
}

fn no_initializer(_: &mut PluginContext<'_>) -> Result<(), KernelError> {
    Ok(())
}

/// What a plugin initializer sees: its own data and the registry.
pub struct PluginContext<'a> {
    plugin: &'a Plugin,
    registry: &'a mut ComponentRegistry,
}

impl PluginContext<'_> {
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin.id
    }

    /// This plugin's data of type `T`.
    pub fn data<T: Any>(&self) -> Result<&T, KernelError> {
        self.plugin
            .data::<T>()
            .ok_or_else(|| KernelError::MissingPluginData {
                plugin: self.plugin.id.to_string(),
                expected: type_name::<T>(),
            })
    }

    pub fn registry(&mut self) -> &mut ComponentRegistry {
        self.registry
    }

    pub fn add_actor<T, F>(
        &mut self,
        id: ComponentId,
        dependencies: Vec<ComponentId>,
        constructor: F,
    ) -> Result<(), KernelError>
    where
        T: Any,
        F: FnOnce(&mut Context) -> Result<T, KernelError> + 'static,
    {
        self.registry.add_actor(id, dependencies, constructor)
    }

    pub fn add_data_manager<T, F>(
        &mut self,
        id: ComponentId,
        dependencies: Vec<ComponentId>,
        constructor: F,
    ) -> Result<(), KernelError>
    where
        T: Any,
        F: FnOnce(&mut Context) -> Result<T, KernelError> + 'static,
    {
        self.registry.add_data_manager(id, dependencies, constructor)
    }

    pub fn add_resolver<T, F>(
        &mut self,
        id: ComponentId,
        dependencies: Vec<ComponentId>,
        constructor: F,
    ) -> Result<(), KernelError>
    where
        T: Any,
        F: FnOnce(&mut Context) -> Result<T, KernelError> + 'static,
    {
        self.registry.add_resolver(id, dependencies, constructor)
    }
}

/// Runs plugin initializers in plugin dependency order and returns the
/// resulting component registry.
pub fn assemble_registry(plugins: &[Plugin]) -> Result<ComponentRegistry, KernelError> {
    let graph: Vec<(PluginId, Vec<PluginId>)> = plugins
        .iter()
        .map(|plugin| (plugin.id.clone(), plugin.dependencies.clone()))
        .collect();
    let order = dependency_order(&graph, "plugin")?;

    let mut registry = ComponentRegistry::new();
    for index in order {
        let plugin = &plugins[index];
        debug!(plugin = %plugin.id, "initializing plugin");
        let mut context = PluginContext {
            plugin,
            registry: &mut registry,
        };
        (plugin.initializer)(&mut context)?;
    }
    Ok(registry)
}
