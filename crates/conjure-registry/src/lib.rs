//! Conjure Registry - The tool catalog
//!
//! Maps `tool_id` to immutable [`ToolDefinition`]s, with reverse indexes by
//! platform command name and by category. The catalog is assembled at
//! startup from static definitions plus definitions discovered from remote
//! catalog sources, and rebuilt on an explicit reload signal.
//!
//! The swap is atomic: the registry holds an `Arc<Catalog>` behind a lock
//! and replaces the whole `Arc`. In-flight lookups keep the snapshot they
//! started with; they see the old catalog or the new, never a torn state.

pub mod schema;
pub mod source;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use conjure_types::{NormalizedInputs, Platform, ToolDefinition, ToolId, Visibility};

pub use schema::{validate_fields, validate_inputs, FieldError};
pub use source::{CatalogSource, RemoteCatalogSource, StaticCatalogSource};

/// Errors from registry operations
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("Tool not found: {tool_id}")]
    ToolNotFound { tool_id: String },

    #[error("Duplicate tool id in catalog: {tool_id}")]
    DuplicateTool { tool_id: String },

    #[error("Input validation failed for {tool_id}")]
    ValidationFailed {
        tool_id: String,
        errors: Vec<FieldError>,
    },

    #[error("Catalog source error: {message}")]
    SourceError { message: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Discovery filter for `list`
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    pub category: Option<String>,
    /// Include unlisted/internal tools
    pub include_hidden: bool,
}

/// One immutable snapshot of the tool catalog
pub struct Catalog {
    pub version: u64,
    tools: HashMap<ToolId, Arc<ToolDefinition>>,
    by_command: HashMap<String, ToolId>,
    by_category: HashMap<String, Vec<ToolId>>,
    /// Stable discovery order (insertion order of the load)
    order: Vec<ToolId>,
}

impl Catalog {
    fn build(version: u64, definitions: Vec<ToolDefinition>) -> Result<Self> {
        let mut tools = HashMap::new();
        let mut by_command = HashMap::new();
        let mut by_category: HashMap<String, Vec<ToolId>> = HashMap::new();
        let mut order = Vec::new();

        for mut def in definitions {
            if tools.contains_key(&def.id) {
                return Err(RegistryError::DuplicateTool {
                    tool_id: def.id.to_string(),
                });
            }
            truncate_platform_descriptions(&mut def);
            if let Some(command) = &def.command {
                by_command.insert(command.clone(), def.id.clone());
            }
            if let Some(category) = &def.category {
                by_category
                    .entry(category.clone())
                    .or_default()
                    .push(def.id.clone());
            }
            order.push(def.id.clone());
            tools.insert(def.id.clone(), Arc::new(def));
        }

        Ok(Self {
            version,
            tools,
            by_command,
            by_category,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Tool descriptions longer than a platform's display limit are shortened
/// at load time, for that platform's variant only.
fn truncate_platform_descriptions(def: &mut ToolDefinition) {
    for platform in [Platform::Telegram, Platform::Discord] {
        let Some(limit) = platform.description_limit() else {
            continue;
        };
        let text = def
            .platform_descriptions
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| def.description.clone());
        if text.chars().count() > limit {
            let mut truncated: String = text.chars().take(limit.saturating_sub(1)).collect();
            truncated.push('…');
            def.platform_descriptions.insert(platform, truncated);
        }
    }
}

/// The process-wide tool registry.
///
/// The one justified singleton: shared by the front door, the engine, the
/// spell runner, and the quoter, all of which treat definitions as
/// immutable snapshots.
pub struct ToolRegistry {
    catalog: RwLock<Arc<Catalog>>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn empty() -> Self {
        Self {
            catalog: RwLock::new(Arc::new(
                Catalog::build(0, Vec::new()).expect("empty catalog"),
            )),
        }
    }

    /// Create a registry preloaded with definitions
    pub fn with_definitions(definitions: Vec<ToolDefinition>) -> Result<Self> {
        let registry = Self::empty();
        registry.install(definitions)?;
        Ok(registry)
    }

    /// Take the current catalog snapshot
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    /// Gather definitions from the given sources and swap in a fresh catalog.
    pub async fn reload(&self, sources: &[Arc<dyn CatalogSource>]) -> Result<usize> {
        let mut definitions = Vec::new();
        for source in sources {
            let mut batch = source
                .fetch()
                .await
                .map_err(|e| RegistryError::SourceError {
                    message: e.to_string(),
                })?;
            definitions.append(&mut batch);
        }
        let count = definitions.len();
        self.install(definitions)?;
        Ok(count)
    }

    /// Build and atomically install a new catalog.
    pub fn install(&self, definitions: Vec<ToolDefinition>) -> Result<()> {
        let next_version = self.catalog.read().version + 1;
        let catalog = Arc::new(Catalog::build(next_version, definitions)?);
        tracing::info!(
            version = catalog.version,
            tools = catalog.len(),
            "tool catalog installed"
        );
        *self.catalog.write() = catalog;
        Ok(())
    }

    /// Look up a tool definition
    pub fn get(&self, tool_id: &ToolId) -> Result<Arc<ToolDefinition>> {
        self.snapshot()
            .tools
            .get(tool_id)
            .cloned()
            .ok_or_else(|| RegistryError::ToolNotFound {
                tool_id: tool_id.to_string(),
            })
    }

    /// Ordered list of tools for discovery
    pub fn list(&self, filter: &ToolFilter) -> Vec<Arc<ToolDefinition>> {
        let catalog = self.snapshot();
        catalog
            .order
            .iter()
            .filter_map(|id| catalog.tools.get(id))
            .filter(|def| filter.include_hidden || def.visibility == Visibility::Public)
            .filter(|def| {
                filter
                    .category
                    .as_ref()
                    .map(|c| def.category.as_deref() == Some(c.as_str()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Resolve a platform command name ("dream") to its tool
    pub fn resolve_command(&self, command: &str) -> Option<Arc<ToolDefinition>> {
        let catalog = self.snapshot();
        catalog
            .by_command
            .get(command)
            .and_then(|id| catalog.tools.get(id))
            .cloned()
    }

    /// Tools in a category, in discovery order
    pub fn by_category(&self, category: &str) -> Vec<Arc<ToolDefinition>> {
        let catalog = self.snapshot();
        catalog
            .by_category
            .get(category)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| catalog.tools.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate and normalize raw inputs against a tool's schema.
    pub fn validate(
        &self,
        tool_id: &ToolId,
        inputs: &serde_json::Value,
    ) -> Result<NormalizedInputs> {
        let tool = self.get(tool_id)?;
        validate_inputs(&tool, inputs).map_err(|errors| RegistryError::ValidationFailed {
            tool_id: tool_id.to_string(),
            errors,
        })
    }

    /// Version of the live catalog
    pub fn catalog_version(&self) -> u64 {
        self.snapshot().version
    }
}
