//! # laminate
//!
//! Layer-stack composition and incremental change processing for layered
//! scene description.
//!
//! A scene is described by documents ("layers") that sublayer one another.
//! This crate computes the flattened, strength-ordered **layer stack** for a
//! root (and optional session) layer, resolves **relocations** authored
//! across the stack, composes **expression variables** with provenance, and
//! turns raw per-layer edit batches into the **minimal set of invalidations**
//! a host cache must honor:
//!
//! - **Layer stacks**: session subtree first, then root subtree, depth-first;
//!   cumulative time offsets with per-layer rate scaling; muted layers,
//!   sublayer cycles, and session-owner reordering handled in place.
//! - **Relocations**: validated, conflict-checked source→target maps with
//!   origin chaining and bidirectional inverses.
//! - **Expression variables**: `${var}` references in sublayer paths,
//!   composed session-over-root with override-source chains shared by `Arc`.
//! - **Change processing**: [`Changes`] classifies edits per entry, fans out
//!   through the host's [`DependencyIndex`], optimizes away subsumed
//!   invalidations, and commits everything in one [`Changes::apply`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use laminate::prelude::*;
//! use std::sync::Arc;
//!
//! let layers = Arc::new(LayerRegistry::new());
//! let root = layers.create("shot.layer");
//! root.push_sublayer("anim.layer", TimeOffset::identity());
//!
//! let cache = Cache::new(
//!     LayerStackIdentifier::new(root.clone(), None),
//!     layers,
//!     Arc::new(NoDependencies),
//!     true,
//!     Config::default(),
//! );
//! let stack = cache.compute_root_layer_stack();
//! println!("{} layers", stack.read().layers().len());
//!
//! // Later, after editing `root`:
//! let mut changes = Changes::new();
//! changes.did_change(&cache, &[(root, change_list)]);
//! changes.apply();
//! ```
//!
//! ## Modules
//!
//! - [`cache`]: the composition cache and muted-layer set
//! - [`stack`]: layer-stack identifiers, trees, and the registry
//! - [`relocates`]: relocation validation and table building
//! - [`vars`]: expression variables and string expressions
//! - [`changes`]: the incremental change processor
//! - [`deps`]: the host dependency-index seam
//! - [`layer`]: the layer model, change lists, and the layer provider
//! - [`path`], [`offset`], [`mapfn`]: paths, time offsets, namespace mappings

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod changes;
pub mod config;
pub mod deps;
pub mod error;
pub mod layer;
pub mod mapfn;
pub mod offset;
pub mod path;
pub mod relocates;
pub mod stack;
pub mod vars;

// =============================================================================
// Prelude - import commonly used items with a single `use`
// =============================================================================

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
///
/// ```ignore
/// use laminate::prelude::*;
/// ```
pub mod prelude {
    // Re-export common items from the crate root
    // (avoids duplication - these are already exported at crate level)

    // Cache and configuration
    pub use crate::{Cache, Config, ConfigBuilder, MutedLayers};

    // Layers
    pub use crate::{ChangeList, Layer, LayerProvider, LayerRegistry};

    // Stacks
    pub use crate::{LayerStack, LayerStackIdentifier, LayerStackRegistry, LayerTree};

    // Change processing
    pub use crate::{CacheChanges, Changes, LayerStackChanges, Lifeboat};

    // Dependencies
    pub use crate::{Dependency, DependencyIndex, NoDependencies};

    // Paths, offsets, errors
    pub use crate::{ComposeError, MapFunction, ScenePath, TimeOffset};
}

// =============================================================================
// Flat re-exports
// =============================================================================

pub use cache::{Cache, MutedLayers};
pub use changes::{CacheChanges, Changes, LayerStackChanges, Lifeboat, target_type};
pub use config::{Config, ConfigBuilder};
pub use deps::{
    Dependency, DependencyIndex, DependencyTypeMask, DynamicFormatDependencies, NoDependencies,
    dependency_type,
};
pub use error::{ComposeError, InvalidRelocation, RelocationConflict, sort_errors};
pub use layer::{
    ChangeEntry, ChangeFlags, ChangeList, InfoChange, Layer, LayerProvider, LayerRegistry,
    SublayerChange, fields, resolve_asset_path,
};
pub use mapfn::MapFunction;
pub use offset::{FALLBACK_TIME_CODES_PER_SECOND, TimeOffset};
pub use path::ScenePath;
pub use relocates::{
    AuthoredRelocate, RelocationTables, collect_relocates, resolve_layer_stack_relocations,
    resolve_relocations,
};
pub use stack::{
    LayerStack, LayerStackContext, LayerStackIdentifier, LayerStackRegistry, LayerTree,
    SublayerSourceInfo, effective_time_codes_per_second,
};
pub use vars::{
    EvaluatedExpression, ExpressionVariableComposer, ExpressionVariables,
    ExpressionVariablesSource, evaluate_string_expression, is_variable_expression,
};
