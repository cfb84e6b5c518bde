//! The spell book - published spell definitions
//!
//! Published spells are immutable by (id, version). Authors evolve a spell
//! by publishing the next version; casts pin the version they started with.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use conjure_types::{SpellDefinition, SpellId};

use crate::{Result, SpellError};

/// How callers name a spell
#[derive(Debug, Clone)]
pub enum SpellRef {
    Id(SpellId),
    Slug(String),
}

impl SpellRef {
    fn describe(&self) -> String {
        match self {
            Self::Id(id) => id.to_string(),
            Self::Slug(slug) => slug.clone(),
        }
    }
}

#[derive(Default)]
struct BookState {
    /// (spell, version) → definition
    versions: HashMap<(SpellId, u32), Arc<SpellDefinition>>,
    /// spell → latest published version
    latest: HashMap<SpellId, u32>,
    /// slug → spell
    by_slug: HashMap<String, SpellId>,
}

/// Store of published spell definitions
#[derive(Default)]
pub struct SpellBook {
    state: RwLock<BookState>,
}

impl SpellBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a definition. The (id, version) pair must be new, and the
    /// step bindings must be internally consistent.
    pub fn publish(&self, definition: SpellDefinition) -> Result<()> {
        definition.check_bindings().map_err(SpellError::Binding)?;

        let mut state = self.state.write();
        let key = (definition.id.clone(), definition.version);
        if state.versions.contains_key(&key) {
            return Err(SpellError::VersionExists {
                spell_id: definition.id.to_string(),
                version: definition.version,
            });
        }

        let latest = state.latest.entry(definition.id.clone()).or_insert(0);
        if definition.version > *latest {
            *latest = definition.version;
        }
        state
            .by_slug
            .insert(definition.slug.clone(), definition.id.clone());
        state.versions.insert(key, Arc::new(definition));
        Ok(())
    }

    /// Resolve a reference to the latest published version.
    pub fn resolve(&self, reference: &SpellRef) -> Result<Arc<SpellDefinition>> {
        let state = self.state.read();
        let id = match reference {
            SpellRef::Id(id) => id.clone(),
            SpellRef::Slug(slug) => state
                .by_slug
                .get(slug)
                .cloned()
                .ok_or_else(|| SpellError::SpellNotFound {
                    reference: reference.describe(),
                })?,
        };
        let version = state
            .latest
            .get(&id)
            .copied()
            .ok_or_else(|| SpellError::SpellNotFound {
                reference: reference.describe(),
            })?;
        state
            .versions
            .get(&(id, version))
            .cloned()
            .ok_or_else(|| SpellError::SpellNotFound {
                reference: reference.describe(),
            })
    }

    /// A specific pinned version, as stored casts reference it.
    pub fn get_version(&self, id: &SpellId, version: u32) -> Result<Arc<SpellDefinition>> {
        self.state
            .read()
            .versions
            .get(&(id.clone(), version))
            .cloned()
            .ok_or_else(|| SpellError::SpellNotFound {
                reference: format!("{}@{}", id, version),
            })
    }

    pub fn len(&self) -> usize {
        self.state.read().versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conjure_types::{InputBinding, SpellStep, ToolId, UserId};
    use std::collections::BTreeMap;

    fn definition(id: SpellId, version: u32, slug: &str) -> SpellDefinition {
        SpellDefinition {
            id,
            version,
            slug: slug.to_string(),
            name: slug.to_string(),
            author: UserId::new(),
            parameters: vec![],
            steps: vec![SpellStep {
                tool_id: ToolId::from("t1"),
                bindings: BTreeMap::from([(
                    "prompt".to_string(),
                    InputBinding::Literal {
                        value: serde_json::json!("hi"),
                    },
                )]),
            }],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_publish_and_resolve() {
        let book = SpellBook::new();
        let id = SpellId::new();
        book.publish(definition(id.clone(), 1, "dream")).unwrap();

        let by_id = book.resolve(&SpellRef::Id(id.clone())).unwrap();
        assert_eq!(by_id.version, 1);
        let by_slug = book.resolve(&SpellRef::Slug("dream".to_string())).unwrap();
        assert_eq!(by_slug.id, id);
    }

    #[test]
    fn test_published_versions_are_immutable() {
        let book = SpellBook::new();
        let id = SpellId::new();
        book.publish(definition(id.clone(), 1, "dream")).unwrap();
        let err = book.publish(definition(id, 1, "dream")).unwrap_err();
        assert!(matches!(err, SpellError::VersionExists { .. }));
    }

    #[test]
    fn test_latest_version_wins_resolution() {
        let book = SpellBook::new();
        let id = SpellId::new();
        book.publish(definition(id.clone(), 1, "dream")).unwrap();
        book.publish(definition(id.clone(), 2, "dream")).unwrap();

        assert_eq!(book.resolve(&SpellRef::Id(id.clone())).unwrap().version, 2);
        // Pinned lookups still reach the old version
        assert_eq!(book.get_version(&id, 1).unwrap().version, 1);
    }

    #[test]
    fn test_unknown_spell() {
        let book = SpellBook::new();
        assert!(book
            .resolve(&SpellRef::Slug("missing".to_string()))
            .is_err());
    }
}
