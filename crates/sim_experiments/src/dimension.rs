//! Dimensions of scenario variation and the cross product over them.
//!
//! A [`Dimension`] is a named list of levels. Each level edits the plugin
//! data of a scenario before it is built and reports one meta value per meta
//! header, so results can be tabulated by level. The experiment's scenarios
//! are the cross product of all dimension levels, enumerated in mixed radix
//! with the first dimension varying fastest.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use sim_core::{Plugin, PluginId};
use tracing::warn;

use crate::error::ExperimentError;

/// Plugin data of one scenario while a level is being applied.
pub struct DimensionContext<'a> {
    plugins: &'a mut [Plugin],
}

impl<'a> DimensionContext<'a> {
    pub(crate) fn new(plugins: &'a mut [Plugin]) -> Self {
        Self { plugins }
    }

    /// Data of type `T` from the first plugin that carries it.
    pub fn data_mut<T: Any>(&mut self) -> Result<&mut T, ExperimentError> {
        self.plugins
            .iter_mut()
            .find_map(|plugin| plugin.data_mut::<T>())
            .ok_or(ExperimentError::MissingPluginData {
                expected: type_name::<T>(),
            })
    }

    /// Data of type `T` from the plugin `id`.
    pub fn plugin_data_mut<T: Any>(&mut self, id: &PluginId) -> Result<&mut T, ExperimentError> {
        self.plugins
            .iter_mut()
            .filter(|plugin| plugin.id() == id)
            .find_map(|plugin| plugin.data_mut::<T>())
            .ok_or(ExperimentError::MissingPluginData {
                expected: type_name::<T>(),
            })
    }
}

type Level = Arc<dyn Fn(&mut DimensionContext<'_>) -> Result<Vec<String>, ExperimentError> + Send + Sync>;

#[derive(Clone)]
pub struct Dimension {
    name: String,
    meta_headers: Vec<String>,
    levels: Vec<Level>,
}

impl Dimension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            meta_headers: Vec::new(),
            levels: Vec::new(),
        }
    }

    pub fn with_meta_header(mut self, header: impl Into<String>) -> Self {
        self.meta_headers.push(header.into());
        self
    }

    /// Adds a level. The returned meta values must match the meta headers
    /// one to one.
    pub fn with_level<F>(mut self, level: F) -> Self
    where
        F: Fn(&mut DimensionContext<'_>) -> Result<Vec<String>, ExperimentError>
            + Send
            + Sync
            + 'static,
    {
        self.levels.push(Arc::new(level));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta_headers(&self) -> &[String] {
        &self.meta_headers
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn apply(
        &self,
        level: usize,
        context: &mut DimensionContext<'_>,
    ) -> Result<Vec<String>, ExperimentError> {
        let values = (self.levels[level])(context)?;
        if values.len() != self.meta_headers.len() {
            return Err(ExperimentError::DimensionMetaMismatch {
                dimension: self.name.clone(),
                level,
                expected: self.meta_headers.len(),
                actual: values.len(),
            });
        }
        Ok(values)
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dimension")
            .field("name", &self.name)
            .field("meta_headers", &self.meta_headers)
            .field("levels", &self.levels.len())
            .finish()
    }
}

/// One point of the cross product: the level chosen on each dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioDescriptor {
    pub index: usize,
    pub levels: Vec<usize>,
}

/// The dimensions that take part in the cross product. Dimensions without
/// levels are dropped with a warning.
#[derive(Debug, Clone, Default)]
pub struct DimensionSpace {
    dimensions: Vec<Dimension>,
}

impl DimensionSpace {
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        let dimensions = dimensions
            .into_iter()
            .filter(|dimension| {
                if dimension.level_count() == 0 {
                    warn!(dimension = dimension.name(), "dimension has no levels; ignored");
                    false
                } else {
                    true
                }
            })
            .collect();
        Self { dimensions }
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Number of scenarios: the product of level counts (1 with no dimensions).
    pub fn scenario_count(&self) -> usize {
        self.dimensions
            .iter()
            .map(Dimension::level_count)
            .product()
    }

    /// Meta headers of all dimensions, in dimension order.
    pub fn meta_headers(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .flat_map(|dimension| dimension.meta_headers().iter().cloned())
            .collect()
    }

    /// Level of each dimension for scenario `index`, first dimension fastest.
    pub fn describe(&self, index: usize) -> ScenarioDescriptor {
        let mut remainder = index;
        let levels = self
            .dimensions
            .iter()
            .map(|dimension| {
                let count = dimension.level_count();
                let level = remainder % count;
                remainder /= count;
                level
            })
            .collect();
        ScenarioDescriptor { index, levels }
    }

    /// Clones `base` and applies the descriptor's levels in dimension order.
    /// Returns the scenario's plugins and its meta values.
    pub fn apply(
        &self,
        descriptor: &ScenarioDescriptor,
        base: &[Plugin],
    ) -> Result<(Vec<Plugin>, Vec<String>), ExperimentError> {
        let mut plugins = base.to_vec();
        let mut meta = Vec::new();
        let mut context = DimensionContext::new(&mut plugins);
        for (dimension, level) in self.dimensions.iter().zip(&descriptor.levels) {
            meta.extend(dimension.apply(*level, &mut context)?);
        }
        Ok((plugins, meta))
    }
}
