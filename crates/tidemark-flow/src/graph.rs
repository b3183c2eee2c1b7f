//! Asset dependency graph and selection resolution.
//!
//! The graph holds two kinds of nodes:
//!
//! - **Defined assets**: produced by runs, may declare upstream dependencies.
//! - **Source assets**: declared inputs with no dependencies of their own.
//!   They only count as updated if something records a materialization for
//!   them in the fact store.
//!
//! A dependency on a key the graph declares neither way is kept on the
//! definition but never resolves as a parent, so it can neither block nor
//! trigger reconciliation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use tidemark_core::AssetKey;

use crate::error::{Error, Result};

/// Parents of each monitored asset, restricted to assets the graph declares.
///
/// Never contains self references.
pub type UpstreamMap = BTreeMap<AssetKey, BTreeSet<AssetKey>>;

/// An asset produced by runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDefinition {
    /// The asset key.
    pub key: AssetKey,
    /// Declared upstream dependencies.
    #[serde(default)]
    pub deps: Vec<AssetKey>,
    /// Optional group name used by group selections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl AssetDefinition {
    /// Creates a definition with the given dependencies and no group.
    #[must_use]
    pub fn new(key: AssetKey, deps: impl IntoIterator<Item = AssetKey>) -> Self {
        Self {
            key,
            deps: deps.into_iter().collect(),
            group: None,
        }
    }

    /// Sets the group name.
    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// An externally produced asset declared so that others may depend on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAsset {
    /// The asset key.
    pub key: AssetKey,
    /// Optional group name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl SourceAsset {
    /// Creates a source asset with no group.
    #[must_use]
    pub fn new(key: AssetKey) -> Self {
        Self { key, group: None }
    }
}

/// A set of assets expressed relative to the graph.
///
/// `Upstream` and `Downstream` include the inner selection itself. A `depth`
/// of `None` walks the full closure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetSelection {
    /// Every defined asset (source assets excluded).
    All,
    /// Explicit keys; each must be declared by the graph.
    Keys {
        /// The selected keys.
        keys: Vec<AssetKey>,
    },
    /// Defined assets in any of the named groups.
    Groups {
        /// Group names.
        groups: Vec<String>,
    },
    /// The inner selection plus its ancestors.
    Upstream {
        /// Selection to expand.
        selection: Box<AssetSelection>,
        /// Maximum number of hops, unbounded when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        depth: Option<u32>,
    },
    /// The inner selection plus its descendants.
    Downstream {
        /// Selection to expand.
        selection: Box<AssetSelection>,
        /// Maximum number of hops, unbounded when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        depth: Option<u32>,
    },
    /// Union of several selections.
    Union {
        /// Selections to combine.
        selections: Vec<AssetSelection>,
    },
}

impl Default for AssetSelection {
    fn default() -> Self {
        Self::Keys { keys: Vec::new() }
    }
}

impl AssetSelection {
    /// Selects every defined asset.
    #[must_use]
    pub fn all() -> Self {
        Self::All
    }

    /// Selects explicit keys.
    #[must_use]
    pub fn keys(keys: impl IntoIterator<Item = AssetKey>) -> Self {
        Self::Keys {
            keys: keys.into_iter().collect(),
        }
    }

    /// Selects defined assets in the given groups.
    #[must_use]
    pub fn groups<S: Into<String>>(groups: impl IntoIterator<Item = S>) -> Self {
        Self::Groups {
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Expands this selection with ancestors up to `depth` hops.
    #[must_use]
    pub fn upstream(self, depth: Option<u32>) -> Self {
        Self::Upstream {
            selection: Box::new(self),
            depth,
        }
    }

    /// Expands this selection with descendants up to `depth` hops.
    #[must_use]
    pub fn downstream(self, depth: Option<u32>) -> Self {
        Self::Downstream {
            selection: Box::new(self),
            depth,
        }
    }

    /// Combines this selection with another.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        match self {
            Self::Union { mut selections } => {
                selections.push(other);
                Self::Union { selections }
            }
            first => Self::Union {
                selections: vec![first, other],
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Walk {
    Upstream,
    Downstream,
}

/// Dependency graph over defined and source assets.
#[derive(Debug, Clone, Default)]
pub struct AssetGraph {
    assets: BTreeMap<AssetKey, AssetDefinition>,
    source_assets: BTreeMap<AssetKey, SourceAsset>,
    /// Children of each declared key, restricted to defined assets.
    downstream: BTreeMap<AssetKey, BTreeSet<AssetKey>>,
}

impl AssetGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from definitions and source assets.
    ///
    /// # Errors
    ///
    /// Returns an error if any key is declared twice.
    pub fn from_parts(
        assets: impl IntoIterator<Item = AssetDefinition>,
        source_assets: impl IntoIterator<Item = SourceAsset>,
    ) -> Result<Self> {
        let mut graph = Self::new();
        for source in source_assets {
            graph.insert_source_asset(source)?;
        }
        for asset in assets {
            graph.insert_asset(asset)?;
        }
        Ok(graph)
    }

    /// Inserts a defined asset.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is already declared.
    pub fn insert_asset(&mut self, asset: AssetDefinition) -> Result<()> {
        self.ensure_undeclared(&asset.key)?;
        for dep in &asset.deps {
            if dep != &asset.key {
                self.downstream
                    .entry(dep.clone())
                    .or_default()
                    .insert(asset.key.clone());
            }
        }
        self.assets.insert(asset.key.clone(), asset);
        Ok(())
    }

    /// Inserts a source asset.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is already declared.
    pub fn insert_source_asset(&mut self, source: SourceAsset) -> Result<()> {
        self.ensure_undeclared(&source.key)?;
        self.source_assets.insert(source.key.clone(), source);
        Ok(())
    }

    fn ensure_undeclared(&self, key: &AssetKey) -> Result<()> {
        if self.contains(key) {
            return Err(Error::configuration(format!(
                "asset '{key}' is declared more than once"
            )));
        }
        Ok(())
    }

    /// Returns true if `key` is a defined or source asset.
    #[must_use]
    pub fn contains(&self, key: &AssetKey) -> bool {
        self.assets.contains_key(key) || self.source_assets.contains_key(key)
    }

    /// Returns true if `key` is a source asset.
    #[must_use]
    pub fn is_source(&self, key: &AssetKey) -> bool {
        self.source_assets.contains_key(key)
    }

    /// Returns the definition for a defined asset.
    #[must_use]
    pub fn definition(&self, key: &AssetKey) -> Option<&AssetDefinition> {
        self.assets.get(key)
    }

    /// Iterates over defined asset keys in order.
    pub fn asset_keys(&self) -> impl Iterator<Item = &AssetKey> {
        self.assets.keys()
    }

    /// Iterates over source asset keys in order.
    pub fn source_asset_keys(&self) -> impl Iterator<Item = &AssetKey> {
        self.source_assets.keys()
    }

    /// Returns the immediate parents of `key` that the graph declares.
    ///
    /// Self dependencies and dependencies on undeclared keys are dropped.
    #[must_use]
    pub fn upstream_of(&self, key: &AssetKey) -> BTreeSet<AssetKey> {
        self.assets
            .get(key)
            .map(|def| {
                def.deps
                    .iter()
                    .filter(|dep| *dep != key && self.contains(dep))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the immediate children of `key`.
    #[must_use]
    pub fn downstream_of(&self, key: &AssetKey) -> BTreeSet<AssetKey> {
        self.downstream.get(key).cloned().unwrap_or_default()
    }

    /// Resolves a selection to a set of declared keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DependencyNotFound`] if an explicit key is not declared.
    pub fn resolve(&self, selection: &AssetSelection) -> Result<BTreeSet<AssetKey>> {
        match selection {
            AssetSelection::All => Ok(self.assets.keys().cloned().collect()),
            AssetSelection::Keys { keys } => keys
                .iter()
                .map(|key| {
                    if self.contains(key) {
                        Ok(key.clone())
                    } else {
                        Err(Error::DependencyNotFound {
                            asset_key: key.to_string(),
                        })
                    }
                })
                .collect(),
            AssetSelection::Groups { groups } => Ok(self
                .assets
                .values()
                .filter(|def| {
                    def.group
                        .as_ref()
                        .is_some_and(|group| groups.iter().any(|g| g == group))
                })
                .map(|def| def.key.clone())
                .collect()),
            AssetSelection::Upstream { selection, depth } => {
                let roots = self.resolve(selection)?;
                Ok(self.walk(roots, *depth, Walk::Upstream))
            }
            AssetSelection::Downstream { selection, depth } => {
                let roots = self.resolve(selection)?;
                Ok(self.walk(roots, *depth, Walk::Downstream))
            }
            AssetSelection::Union { selections } => {
                let mut resolved = BTreeSet::new();
                for inner in selections {
                    resolved.extend(self.resolve(inner)?);
                }
                Ok(resolved)
            }
        }
    }

    /// Builds the upstream map for a selection: every selected key mapped to
    /// its immediate declared parents, excluding itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the selection cannot be resolved.
    pub fn upstream_mapping(&self, selection: &AssetSelection) -> Result<UpstreamMap> {
        let selected = self.resolve(selection)?;
        Ok(selected
            .into_iter()
            .map(|key| {
                let parents = self.upstream_of(&key);
                (key, parents)
            })
            .collect())
    }

    fn walk(
        &self,
        roots: BTreeSet<AssetKey>,
        depth: Option<u32>,
        direction: Walk,
    ) -> BTreeSet<AssetKey> {
        let mut selected = roots.clone();
        let mut queue: VecDeque<(AssetKey, u32)> = roots.into_iter().map(|k| (k, 0)).collect();

        while let Some((current, hops)) = queue.pop_front() {
            if depth.is_some_and(|max| hops >= max) {
                continue;
            }
            let next = match direction {
                Walk::Upstream => self.upstream_of(&current),
                Walk::Downstream => self.downstream_of(&current),
            };
            for key in next {
                if selected.insert(key.clone()) {
                    queue.push_back((key, hops + 1));
                }
            }
        }

        selected
    }
}
