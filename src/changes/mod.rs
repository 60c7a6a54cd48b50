//! Incremental change processing.
//!
//! [`Changes`] consumes per-layer edit batches, classifies every edit into
//! the narrowest invalidation that preserves correctness, and commits the
//! result in [`Changes::apply`]: layer-stack recomputation first, so the
//! dependency queries that follow see fresh structural state, then the
//! per-cache invalidation sets handed to the host. A [`Lifeboat`] keeps
//! layers and stacks alive across the exact moment a change would otherwise
//! drop their last reference.

mod classify;
mod mute;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cache::Cache;
use crate::layer::{ChangeList, Layer};
use crate::path::{ScenePath, retain_roots};
use crate::stack::{LayerStack, LayerStackIdentifier};
use crate::vars::ExpressionVariableComposer;

// =========================================================================
// Change payloads
// =========================================================================

/// Bits recording which flavor of target list changed on a property.
pub mod target_type {
    /// Relationship target list-ops.
    pub const RELATIONSHIP_TARGETS: u32 = 1 << 0;
    /// Attribute connection list-ops.
    pub const CONNECTIONS: u32 = 1 << 1;
}

/// Pending structural changes for one layer stack.
#[derive(Debug, Clone, Default)]
pub struct LayerStackChanges {
    /// The layer list itself must be rebuilt. Subsumes
    /// [`LayerStackChanges::did_change_layer_offsets`].
    pub did_change_layers: bool,
    /// Only offset-derived state must be recomputed.
    pub did_change_layer_offsets: bool,
    /// The relocation tables must be recomputed.
    pub did_change_relocates: bool,
    /// The change invalidates everything composed from this stack.
    pub did_change_significantly: bool,
    /// The composed expression variables must be recomputed.
    pub did_change_expression_variables: bool,
    /// A layer's resolved path changed; whether different layers would open
    /// is checked at apply time.
    pub did_change_resolved_paths: bool,
    /// Paths whose relocation mapping differs between the old and new
    /// tables, from diffing the full source→target maps.
    pub paths_affected_by_relocation_changes: Vec<ScenePath>,
}

impl LayerStackChanges {
    /// Marks the layer list changed, absorbing any pending offsets-only mark.
    pub fn mark_layers_changed(&mut self) {
        self.did_change_layers = true;
        self.did_change_layer_offsets = false;
    }

    fn merge(&mut self, other: &LayerStackChanges) {
        self.did_change_layers |= other.did_change_layers;
        self.did_change_layer_offsets |= other.did_change_layer_offsets;
        self.did_change_relocates |= other.did_change_relocates;
        self.did_change_significantly |= other.did_change_significantly;
        self.did_change_expression_variables |= other.did_change_expression_variables;
        self.did_change_resolved_paths |= other.did_change_resolved_paths;
        self.paths_affected_by_relocation_changes
            .extend(other.paths_affected_by_relocation_changes.iter().cloned());
        self.paths_affected_by_relocation_changes.sort();
        self.paths_affected_by_relocation_changes.dedup();
        if self.did_change_layers {
            self.did_change_layer_offsets = false;
        }
    }
}

/// Pending invalidations for one cache's composed results.
#[derive(Debug, Clone, Default)]
pub struct CacheChanges {
    /// Results needing a full resync, ancestors subsuming descendants.
    pub did_change_significantly: BTreeSet<ScenePath>,
    /// Results whose spec stacks must be rebuilt in place.
    pub did_change_specs: BTreeSet<ScenePath>,
    /// Results whose indexes must be rebuilt without a full resync.
    pub did_change_prims: BTreeSet<ScenePath>,
    /// Properties whose target lists changed, with the flavor bits.
    pub did_change_targets: BTreeMap<ScenePath, u32>,
    /// Explicitly declared renames, in call order.
    pub did_change_renamed_paths: Vec<(ScenePath, ScenePath)>,
    /// Canonical layer paths to mute when applied.
    pub layers_to_mute: Vec<String>,
    /// Canonical layer paths to unmute when applied.
    pub layers_to_unmute: Vec<String>,
}

impl CacheChanges {
    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.did_change_significantly.is_empty()
            && self.did_change_specs.is_empty()
            && self.did_change_prims.is_empty()
            && self.did_change_targets.is_empty()
            && self.did_change_renamed_paths.is_empty()
            && self.layers_to_mute.is_empty()
            && self.layers_to_unmute.is_empty()
    }

    fn merge(&mut self, other: CacheChanges) {
        self.did_change_significantly.extend(other.did_change_significantly);
        self.did_change_specs.extend(other.did_change_specs);
        self.did_change_prims.extend(other.did_change_prims);
        for (path, mask) in other.did_change_targets {
            *self.did_change_targets.entry(path).or_insert(0) |= mask;
        }
        self.did_change_renamed_paths.extend(other.did_change_renamed_paths);
        self.layers_to_mute.extend(other.layers_to_mute);
        self.layers_to_unmute.extend(other.layers_to_unmute);
    }
}

// =========================================================================
// Lifeboat
// =========================================================================

/// Strong references held across an apply so that objects a change
/// invalidates stay alive while their "before" state is still being read.
#[derive(Default)]
pub struct Lifeboat {
    layers: Vec<Layer>,
    layer_stacks: Vec<Arc<RwLock<LayerStack>>>,
}

impl Lifeboat {
    /// Retains a layer until the lifeboat is dropped.
    pub fn retain_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Retains a layer stack until the lifeboat is dropped.
    pub fn retain_layer_stack(&mut self, stack: Arc<RwLock<LayerStack>>) {
        self.layer_stacks.push(stack);
    }

    /// The retained layers.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// The retained layer stacks.
    pub fn layer_stacks(&self) -> &[Arc<RwLock<LayerStack>>] {
        &self.layer_stacks
    }

    fn absorb(&mut self, other: Lifeboat) {
        self.layers.extend(other.layers);
        self.layer_stacks.extend(other.layer_stacks);
    }
}

// =========================================================================
// Changes
// =========================================================================

pub(crate) struct CacheWork {
    pub cache: Cache,
    pub cache_changes: CacheChanges,
    pub layer_stack_changes: FxHashMap<LayerStackIdentifier, LayerStackChanges>,
    /// Low-level rename edits discovered in raw change lists, reconciled
    /// against explicit renames during optimize.
    pub namespace_edits: Vec<(ScenePath, ScenePath)>,
}

/// A batch of pending invalidations across one or more caches.
#[derive(Default)]
pub struct Changes {
    work: Vec<CacheWork>,
    lifeboat: Lifeboat,
}

impl Changes {
    /// An empty batch.
    pub fn new() -> Self {
        Changes::default()
    }

    /// True if no cache has pending work.
    pub fn is_empty(&self) -> bool {
        self.work.is_empty()
    }

    /// The caches with pending work.
    pub fn caches(&self) -> Vec<&Cache> {
        self.work.iter().map(|w| &w.cache).collect()
    }

    /// The pending cache-level invalidations for `cache`.
    pub fn cache_changes(&self, cache: &Cache) -> Option<&CacheChanges> {
        self.work
            .iter()
            .find(|w| &w.cache == cache)
            .map(|w| &w.cache_changes)
    }

    /// The pending per-stack changes for `cache`.
    pub fn layer_stack_changes(
        &self,
        cache: &Cache,
    ) -> Option<&FxHashMap<LayerStackIdentifier, LayerStackChanges>> {
        self.work
            .iter()
            .find(|w| &w.cache == cache)
            .map(|w| &w.layer_stack_changes)
    }

    /// The retained-object list. Read-only; callers that must keep retained
    /// objects alive an extra scope clone the handles out.
    pub fn lifeboat(&self) -> &Lifeboat {
        &self.lifeboat
    }

    pub(crate) fn work_for(&mut self, cache: &Cache) -> &mut CacheWork {
        if let Some(i) = self.work.iter().position(|w| &w.cache == cache) {
            return &mut self.work[i];
        }
        self.work.push(CacheWork {
            cache: cache.clone(),
            cache_changes: CacheChanges::default(),
            layer_stack_changes: FxHashMap::default(),
            namespace_edits: Vec::new(),
        });
        let last = self.work.len() - 1;
        &mut self.work[last]
    }

    // --- intake ---

    /// Classifies an edit batch for `cache`: one change list per edited
    /// layer. Processing never aborts on a bad entry.
    pub fn did_change(&mut self, cache: &Cache, batches: &[(Layer, ChangeList)]) {
        tracing::debug!(cache = ?cache, layers = batches.len(), "classifying change batch");
        for (layer, list) in batches {
            self.classify_layer_changes(cache, layer, list);
        }
    }

    /// Records an explicit namespace edit (rename/reparent) of a composed
    /// result. Matching low-level edits in the same batch are reconciled
    /// against this during optimize.
    pub fn did_change_paths(&mut self, cache: &Cache, old_path: &ScenePath, new_path: &ScenePath) {
        let work = self.work_for(cache);
        work.cache_changes
            .did_change_renamed_paths
            .push((old_path.clone(), new_path.clone()));
    }

    /// Drops all pending work for a cache being destroyed.
    pub fn did_destroy_cache(&mut self, cache: &Cache) {
        self.work.retain(|w| &w.cache != cache);
    }

    /// Merges another batch's pending work into this one, leaving `other`
    /// empty. Batches must have been built against the same cache state.
    pub fn swap(&mut self, other: &mut Changes) {
        for other_work in other.work.drain(..) {
            let work = self.work_for(&other_work.cache);
            work.cache_changes.merge(other_work.cache_changes);
            for (id, flags) in other_work.layer_stack_changes {
                work.layer_stack_changes.entry(id).or_default().merge(&flags);
            }
            work.namespace_edits.extend(other_work.namespace_edits);
        }
        self.lifeboat.absorb(std::mem::take(&mut other.lifeboat));
    }

    // --- commit ---

    /// Commits everything: per cache, optimizes the pending sets, updates
    /// the muted-layer set, recomputes changed layer stacks, then hands the
    /// final invalidation sets to the host's dependency index.
    pub fn apply(&mut self) {
        let work = std::mem::take(&mut self.work);
        for mut work in work {
            optimize(&mut work);
            let cache = work.cache.clone();
            tracing::debug!(
                cache = ?cache,
                significant = work.cache_changes.did_change_significantly.len(),
                specs = work.cache_changes.did_change_specs.len(),
                stacks = work.layer_stack_changes.len(),
                "applying changes"
            );

            cache.apply_muting(
                &work.cache_changes.layers_to_mute,
                &work.cache_changes.layers_to_unmute,
            );

            // Stacks first: cache-level commits below must observe fresh
            // structural state.
            let mut composer = ExpressionVariableComposer::new();
            for (id, flags) in &work.layer_stack_changes {
                let Some(stack) = cache.layer_stacks().find(id) else {
                    continue;
                };
                self.lifeboat.retain_layer_stack(Arc::clone(&stack));
                let mut guard = stack.write();
                let old_layers: Vec<Layer> = guard.layers().to_vec();
                for layer in old_layers {
                    self.lifeboat.retain_layer(layer);
                }

                cache.with_context(|ctx| {
                    let rebuild_layers = flags.did_change_layers
                        || flags.did_change_significantly
                        || (flags.did_change_resolved_paths
                            && classify::asset_paths_are_stale(&guard));
                    if rebuild_layers {
                        let vars = composer.compute(id, ctx.cache_root);
                        guard.recompute_layers_with_vars(ctx, vars);
                    } else {
                        if flags.did_change_expression_variables {
                            guard.set_expression_variables(composer.compute(id, ctx.cache_root));
                        }
                        if flags.did_change_layer_offsets {
                            // An offset edit keeps the layer set itself, so
                            // the rebuild can run against already-open layers.
                            guard.recompute_layer_offsets(ctx);
                        } else if flags.did_change_relocates {
                            guard.recompute_relocations(ctx);
                        }
                    }
                });
            }

            cache.dependency_index().commit(&work.cache_changes);
        }
    }
}

// =========================================================================
// Optimize
// =========================================================================

/// Reduces the pending sets to their minimal equivalent before apply.
fn optimize(work: &mut CacheWork) {
    let changes = &mut work.cache_changes;

    // Reconcile low-level namespace edits against explicit renames. An edit
    // without a matching declaration degrades to a significant resync of
    // both endpoints; silent data loss is worse than over-invalidation.
    let explicit: FxHashSet<(ScenePath, ScenePath)> =
        changes.did_change_renamed_paths.iter().cloned().collect();
    for (old_path, new_path) in work.namespace_edits.drain(..) {
        if explicit.contains(&(old_path.clone(), new_path.clone())) {
            changes.did_change_prims.insert(new_path);
        } else {
            changes.did_change_significantly.insert(old_path);
            changes.did_change_significantly.insert(new_path);
        }
    }

    // A significant ancestor subsumes every descendant entry everywhere.
    retain_roots(&mut changes.did_change_significantly);
    let significant = changes.did_change_significantly.clone();
    let subsumed =
        |path: &ScenePath| path.ancestors().any(|ancestor| significant.contains(&ancestor));
    changes.did_change_specs.retain(|p| !subsumed(p));
    changes.did_change_prims.retain(|p| !subsumed(p));
    changes.did_change_targets.retain(|p, _| !subsumed(p));

    // A full index rebuild subsumes a spec-stack-only rebuild.
    let prims = changes.did_change_prims.clone();
    changes.did_change_specs.retain(|p| !prims.contains(p));

    for flags in work.layer_stack_changes.values_mut() {
        if flags.did_change_layers {
            flags.did_change_layer_offsets = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::cache::Cache;
    use crate::config::Config;
    use crate::deps::NoDependencies;
    use crate::layer::{LayerProvider, LayerRegistry, SublayerChange};
    use crate::offset::TimeOffset;
    use crate::stack::LayerStackIdentifier;

    /// Counts how many times composition asks to open (rather than merely
    /// find) a layer.
    struct CountingProvider {
        layers: Arc<LayerRegistry>,
        opens: AtomicUsize,
    }

    impl LayerProvider for CountingProvider {
        fn find(&self, identifier: &str) -> Option<Layer> {
            self.layers.find(identifier)
        }

        fn find_or_open(&self, identifier: &str) -> Option<Layer> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            self.layers.find(identifier)
        }
    }

    fn test_cache() -> Cache {
        let layers = Arc::new(LayerRegistry::new());
        let root = layers.create("root.layer");
        Cache::new(
            LayerStackIdentifier::new(root, None),
            layers,
            Arc::new(NoDependencies),
            true,
            Config::default(),
        )
    }

    fn work_with(cache: &Cache, changes: CacheChanges) -> CacheWork {
        CacheWork {
            cache: cache.clone(),
            cache_changes: changes,
            layer_stack_changes: FxHashMap::default(),
            namespace_edits: Vec::new(),
        }
    }

    #[test]
    fn test_optimize_subsumption() {
        let cache = test_cache();
        let mut changes = CacheChanges::default();
        changes.did_change_significantly.insert(ScenePath::new("/A"));
        changes.did_change_significantly.insert(ScenePath::new("/A/B"));
        changes.did_change_specs.insert(ScenePath::new("/A/C"));
        changes.did_change_specs.insert(ScenePath::new("/D"));
        changes.did_change_prims.insert(ScenePath::new("/D"));
        changes.did_change_targets.insert(ScenePath::new("/A/B.rel"), target_type::RELATIONSHIP_TARGETS);

        let mut work = work_with(&cache, changes);
        optimize(&mut work);
        let changes = &work.cache_changes;

        assert!(changes.did_change_significantly.contains(&ScenePath::new("/A")));
        assert!(!changes.did_change_significantly.contains(&ScenePath::new("/A/B")));
        assert!(changes.did_change_specs.is_empty());
        assert!(changes.did_change_prims.contains(&ScenePath::new("/D")));
        assert!(changes.did_change_targets.is_empty());
    }

    #[test]
    fn test_unmatched_namespace_edit_degrades_to_significant() {
        let cache = test_cache();
        let mut work = work_with(&cache, CacheChanges::default());
        work.cache_changes
            .did_change_renamed_paths
            .push((ScenePath::new("/A"), ScenePath::new("/B")));
        work.namespace_edits.push((ScenePath::new("/A"), ScenePath::new("/B")));
        work.namespace_edits.push((ScenePath::new("/C"), ScenePath::new("/D")));
        optimize(&mut work);
        let changes = &work.cache_changes;

        // The declared rename rebuilds at its new path; the undeclared one
        // resyncs both endpoints.
        assert!(changes.did_change_prims.contains(&ScenePath::new("/B")));
        assert!(changes.did_change_significantly.contains(&ScenePath::new("/C")));
        assert!(changes.did_change_significantly.contains(&ScenePath::new("/D")));
        assert!(!changes.did_change_significantly.contains(&ScenePath::new("/A")));
    }

    #[test]
    fn test_swap_merges_batches() {
        let cache = test_cache();
        let mut a = Changes::new();
        a.work_for(&cache)
            .cache_changes
            .did_change_significantly
            .insert(ScenePath::new("/A"));
        let mut b = Changes::new();
        b.work_for(&cache)
            .cache_changes
            .did_change_specs
            .insert(ScenePath::new("/B"));

        a.swap(&mut b);
        assert!(b.is_empty());
        let changes = a.cache_changes(&cache).unwrap();
        assert!(changes.did_change_significantly.contains(&ScenePath::new("/A")));
        assert!(changes.did_change_specs.contains(&ScenePath::new("/B")));
    }

    #[test]
    fn test_offset_edit_applies_without_reopening_layers() {
        let layers = Arc::new(LayerRegistry::new());
        let root = layers.create("root.layer");
        let sub = layers.create("sub.layer");
        root.push_sublayer("sub.layer", TimeOffset::identity());
        let provider =
            Arc::new(CountingProvider { layers, opens: AtomicUsize::new(0) });
        let cache = Cache::new(
            LayerStackIdentifier::new(root.clone(), None),
            provider.clone(),
            Arc::new(NoDependencies),
            true,
            Config::default(),
        );
        let stack = cache.compute_root_layer_stack();
        let opens_before_edit = provider.opens.load(Ordering::Relaxed);

        root.set_sublayer_offset(0, TimeOffset::new(10.0, 1.0));
        let mut list = ChangeList::new();
        list.record_sublayer_change("sub.layer", SublayerChange::Offset);
        let mut changes = Changes::new();
        changes.did_change(&cache, &[(root, list)]);
        changes.apply();

        // The layer set is unchanged; the rebuild ran against already-open
        // layers and never asked to open a document.
        assert_eq!(provider.opens.load(Ordering::Relaxed), opens_before_edit);
        assert_eq!(
            stack.read().offset_for_layer(&sub),
            Some(TimeOffset::new(10.0, 1.0))
        );
    }

    #[test]
    fn test_destroyed_cache_dropped() {
        let cache = test_cache();
        let mut changes = Changes::new();
        changes.did_change_paths(&cache, &ScenePath::new("/A"), &ScenePath::new("/B"));
        assert!(!changes.is_empty());
        changes.did_destroy_cache(&cache);
        assert!(changes.is_empty());
    }
}
