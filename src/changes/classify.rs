//! Edit classification.
//!
//! Each change-list entry is mapped to the narrowest pending invalidation:
//! full resync, spec-stack rebuild, target-list refresh, or a structural
//! layer-stack change. The rules here decide significance; fan-out to the
//! cached results that consume an edited site goes through the host's
//! [`DependencyIndex`](crate::deps::DependencyIndex).

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::{CacheWork, Changes, target_type};
use crate::cache::Cache;
use crate::deps::dependency_type;
use crate::layer::{
    ChangeEntry, ChangeList, Layer, SublayerChange, fields, resolve_asset_path,
};
use crate::offset::FALLBACK_TIME_CODES_PER_SECOND;
use crate::path::ScenePath;
use crate::relocates::resolve_layer_stack_relocations;
use crate::stack::{LayerStack, LayerStackIdentifier};
use crate::vars::{ExpressionVariableComposer, evaluate_string_expression, is_variable_expression};

pub(crate) type StackList = [(LayerStackIdentifier, Arc<RwLock<LayerStack>>)];

impl Changes {
    /// Classifies one layer's edit batch against one cache.
    pub(crate) fn classify_layer_changes(&mut self, cache: &Cache, layer: &Layer, list: &ChangeList) {
        // An edit to the cache's own root or session layer must see the root
        // stack even if nothing has asked for it yet.
        let root_id = cache.root_identifier().clone();
        if layer == &root_id.root_layer || root_id.session_layer.as_ref() == Some(layer) {
            cache.compute_root_layer_stack();
        }

        let stacks = cache.layer_stacks().stacks_using_layer(layer);
        if stacks.is_empty() {
            tracing::debug!(layer = %layer.identifier(), "edited layer is not in any stack");
            return;
        }
        self.classify_layer_changes_in(cache, layer, list, &stacks);
    }

    /// Classifies an edit batch against an explicit stack list. Muting uses
    /// this: an unmuted layer's stacks are found by their mute records, not
    /// by membership.
    pub(crate) fn classify_layer_changes_in(
        &mut self,
        cache: &Cache,
        layer: &Layer,
        list: &ChangeList,
        stacks: &StackList,
    ) {
        let work = self.work_for(cache);
        for (path, entry) in list.entries() {
            if path.is_absolute_root() {
                classify_root_entry(work, cache, layer, stacks, entry);
            } else if path.is_prim_or_variant_path() {
                classify_prim_entry(work, cache, stacks, path, entry);
            } else if path.is_property_path() {
                classify_property_entry(work, cache, stacks, path, entry);
            }
        }
    }
}

// =========================================================================
// Root entries
// =========================================================================

fn classify_root_entry(
    work: &mut CacheWork,
    cache: &Cache,
    layer: &Layer,
    stacks: &StackList,
    entry: &ChangeEntry,
) {
    if entry.flags.did_replace_content || entry.flags.did_change_identifier {
        for (id, _) in stacks {
            mark_stack_significant(work, cache, id);
        }
    }

    for info in &entry.info_changed {
        match info.field.as_str() {
            fields::DEFAULT_PRIM => {
                // Only the old and new root prims change meaning.
                for name in [&info.old, &info.new] {
                    if let Some(Value::String(prim)) = name {
                        let path = ScenePath::absolute_root().append_child(prim);
                        resync_dependents(work, cache, stacks, &path);
                    }
                }
            }
            fields::TIME_CODES_PER_SECOND | fields::FRAMES_PER_SECOND => {
                classify_rate_change(
                    work,
                    cache,
                    layer,
                    stacks,
                    &info.field,
                    info.old.as_ref(),
                    info.new.as_ref(),
                );
            }
            fields::EXPRESSION_VARIABLES => {
                classify_expression_variables_change(work, cache);
            }
            fields::LAYER_RELOCATES => {
                classify_relocates_change(work, cache, stacks);
            }
            fields::OWNER | fields::SESSION_OWNER | fields::HAS_OWNED_SUBLAYERS => {
                // Ownership reorders the sublayer list itself.
                for (id, _) in stacks {
                    mark_stack_significant(work, cache, id);
                }
            }
            field => {
                classify_dynamic_format_field(
                    work,
                    cache,
                    stacks,
                    &ScenePath::absolute_root(),
                    field,
                    info.old.as_ref(),
                    info.new.as_ref(),
                );
            }
        }
    }

    if entry.flags.did_change_resolved_path {
        for (id, stack) in stacks {
            work.layer_stack_changes
                .entry(id.clone())
                .or_default()
                .did_change_resolved_paths = true;
            if asset_paths_are_stale(&stack.read()) {
                mark_stack_significant(work, cache, id);
            }
        }
    }

    for (sub_path, change) in &entry.sublayer_changes {
        match change {
            SublayerChange::Added | SublayerChange::Removed => {
                classify_sublayer_change(work, cache, layer, stacks, sub_path);
            }
            SublayerChange::Offset => {
                mark_offsets_changed(work, cache, stacks);
            }
        }
    }
}

/// Per-stack verdict for one sublayer-list edit.
struct SublayerSignificance {
    identifier: LayerStackIdentifier,
    significant: bool,
}

fn classify_sublayer_change(
    work: &mut CacheWork,
    cache: &Cache,
    layer: &Layer,
    stacks: &StackList,
    authored_path: &str,
) {
    // Decide significance per stack first: the same authored path can
    // resolve through different expression variables in different stacks.
    let mut verdicts = Vec::with_capacity(stacks.len());
    for (id, stack) in stacks {
        let resolved = if is_variable_expression(authored_path) {
            let vars = Arc::clone(stack.read().expression_variables());
            match evaluate_string_expression(authored_path, vars.variables()) {
                Ok(evaluated) => resolve_asset_path(&layer.identifier(), &evaluated.value),
                Err(_) => {
                    verdicts.push(SublayerSignificance {
                        identifier: id.clone(),
                        significant: true,
                    });
                    continue;
                }
            }
        } else {
            resolve_asset_path(&layer.identifier(), authored_path)
        };

        // Only a sublayer with opinions changes composition significantly.
        // One that cannot be opened contributes nothing beyond the layer
        // list itself, same as a present-but-empty layer.
        let sublayer = cache.with_context(|ctx| ctx.provider.find_or_open(&resolved));
        let significant = match sublayer {
            Some(sub) => !sub.is_empty(),
            None => false,
        };
        verdicts.push(SublayerSignificance {
            identifier: id.clone(),
            significant,
        });
    }

    for verdict in verdicts {
        let flags = work.layer_stack_changes.entry(verdict.identifier.clone()).or_default();
        flags.mark_layers_changed();
        if verdict.significant {
            flags.did_change_significantly = true;
            resync_stack(work, cache, &verdict.identifier);
        } else {
            // The layer list still changes, but no composed opinion does;
            // existing results only refresh their contributing spec stacks.
            let root = ScenePath::absolute_root();
            if &verdict.identifier == cache.root_identifier() {
                work.cache_changes.did_change_specs.insert(root.clone());
            }
            for dep in dependents(cache, &verdict.identifier, &root, false, true) {
                work.cache_changes.did_change_specs.insert(dep);
            }
        }
    }
}

// =========================================================================
// Time-code rates
// =========================================================================

/// A single layer's effective rate with one field forced to a given value.
fn layer_rate(layer: &Layer, substitute: (&str, Option<&Value>)) -> f64 {
    let root = ScenePath::absolute_root();
    let get = |field: &str| -> Option<f64> {
        if field == substitute.0 {
            substitute.1.and_then(Value::as_f64)
        } else {
            layer.field(&root, field).and_then(|v| v.as_f64())
        }
    };
    get(fields::TIME_CODES_PER_SECOND)
        .or_else(|| get(fields::FRAMES_PER_SECOND))
        .unwrap_or(FALLBACK_TIME_CODES_PER_SECOND)
}

/// A stack's effective rate with one field of one member layer forced.
fn stack_rate(
    id: &LayerStackIdentifier,
    edited: &Layer,
    field: &str,
    value: Option<&Value>,
) -> f64 {
    let rate_of = |layer: &Layer, which: &str| -> Option<f64> {
        let substitute = if layer == edited && which == field {
            value.cloned()
        } else {
            layer.field(&ScenePath::absolute_root(), which)
        };
        substitute.and_then(|v| v.as_f64())
    };
    let session = id.session_layer.as_ref();
    session
        .and_then(|s| rate_of(s, fields::TIME_CODES_PER_SECOND))
        .or_else(|| rate_of(&id.root_layer, fields::TIME_CODES_PER_SECOND))
        .or_else(|| session.and_then(|s| rate_of(s, fields::FRAMES_PER_SECOND)))
        .or_else(|| rate_of(&id.root_layer, fields::FRAMES_PER_SECOND))
        .unwrap_or(FALLBACK_TIME_CODES_PER_SECOND)
}

fn classify_rate_change(
    work: &mut CacheWork,
    cache: &Cache,
    layer: &Layer,
    stacks: &StackList,
    field: &str,
    old: Option<&Value>,
    new: Option<&Value>,
) {
    let scale = cache.config().scale_offsets_by_tcps;
    let member_rate_changed =
        scale && layer_rate(layer, (field, old)) != layer_rate(layer, (field, new));

    for (id, _) in stacks {
        let triggered = if member_rate_changed {
            true
        } else if layer == &id.root_layer || id.session_layer.as_ref() == Some(layer) {
            // An opinion appearing or vanishing without moving the effective
            // stack rate changes nothing.
            stack_rate(id, layer, field, old) != stack_rate(id, layer, field, new)
        } else {
            false
        };
        if triggered {
            mark_offsets_changed_for(work, cache, id);
        }
    }
}

fn mark_offsets_changed(work: &mut CacheWork, cache: &Cache, stacks: &StackList) {
    for (id, _) in stacks {
        mark_offsets_changed_for(work, cache, id);
    }
}

fn mark_offsets_changed_for(work: &mut CacheWork, cache: &Cache, id: &LayerStackIdentifier) {
    let flags = work.layer_stack_changes.entry(id.clone()).or_default();
    if !flags.did_change_layers {
        flags.did_change_layer_offsets = true;
    }
    // Offsets are baked into every mapping composed through the stack.
    resync_stack(work, cache, id);
}

// =========================================================================
// Expression variables
// =========================================================================

/// Recomputes every stack's composed variables and compares. Walking all
/// stacks instead of just those containing the edited layer covers stacks
/// that inherit the edit through an override-source chain.
fn classify_expression_variables_change(work: &mut CacheWork, cache: &Cache) {
    let deps = Arc::clone(cache.dependency_index());
    let mut composer = ExpressionVariableComposer::new();

    for (id, stack) in cache.layer_stacks().all() {
        let old = Arc::clone(stack.read().expression_variables());
        let new = composer.compute(&id, cache.root_identifier());
        if *new == *old {
            continue;
        }

        let flags = work.layer_stack_changes.entry(id.clone()).or_default();
        flags.did_change_expression_variables = true;

        let used = stack.read().used_expression_variables().clone();
        if new.source() != old.source() {
            // Different provenance invalidates every consumer: a result
            // cannot tell whether the values it read survive.
            if !used.is_empty() {
                work.layer_stack_changes
                    .entry(id.clone())
                    .or_default()
                    .mark_layers_changed();
                mark_stack_significant(work, cache, &id);
            }
            for path in deps.prims_using_expression_variables(&id) {
                work.cache_changes.did_change_significantly.insert(path);
            }
        } else {
            let changed = new.changed_names(&old);
            if changed.iter().any(|name| used.contains(name)) {
                // A sublayer path expression consumed a changed variable.
                work.layer_stack_changes
                    .entry(id.clone())
                    .or_default()
                    .mark_layers_changed();
                mark_stack_significant(work, cache, &id);
            }
            for path in deps.prims_using_expression_variables(&id) {
                if changed
                    .iter()
                    .any(|name| deps.prim_uses_expression_variable(&path, name))
                {
                    work.cache_changes.did_change_significantly.insert(path);
                }
            }
        }
    }
}

// =========================================================================
// Relocations
// =========================================================================

fn classify_relocates_change(work: &mut CacheWork, cache: &Cache, stacks: &StackList) {
    for (id, stack) in stacks {
        let guard = stack.read();
        let mut errors = Vec::new();
        let new_tables = cache.with_context(|ctx| {
            resolve_layer_stack_relocations(
                guard.layers(),
                ctx.usd_mode,
                ctx.config.legacy_relocates,
                &mut errors,
            )
        });
        let changed = new_tables.changed_paths(guard.relocations());
        drop(guard);
        if changed.is_empty() {
            continue;
        }

        let flags = work.layer_stack_changes.entry(id.clone()).or_default();
        flags.did_change_relocates = true;
        flags
            .paths_affected_by_relocation_changes
            .extend(changed.iter().cloned());
        flags.paths_affected_by_relocation_changes.sort();
        flags.paths_affected_by_relocation_changes.dedup();

        for path in &changed {
            resync_dependents_of(work, cache, id, path);
        }
    }
}

// =========================================================================
// Prim entries
// =========================================================================

fn classify_prim_entry(
    work: &mut CacheWork,
    cache: &Cache,
    stacks: &StackList,
    path: &ScenePath,
    entry: &ChangeEntry,
) {
    let flags = &entry.flags;
    if flags.did_rename {
        if let Some(old_path) = &entry.old_path {
            work.namespace_edits.push((old_path.clone(), path.clone()));
        }
    }

    let mut significant = flags.did_add_non_inert_prim
        || flags.did_remove_non_inert_prim
        || flags.did_change_prim_inherit_paths
        || flags.did_change_prim_specializes
        || flags.did_change_prim_references
        || flags.did_change_prim_variant_sets;

    for info in &entry.info_changed {
        match info.field.as_str() {
            fields::PAYLOAD
            | fields::PERMISSION
            | fields::VARIANT_SELECTION
            | fields::INSTANCEABLE => significant = true,
            fields::RELOCATES if !cache.usd_mode() => {
                classify_relocates_change(work, cache, stacks);
            }
            field => {
                classify_dynamic_format_field(
                    work,
                    cache,
                    stacks,
                    path,
                    field,
                    info.old.as_ref(),
                    info.new.as_ref(),
                );
            }
        }
    }

    if significant {
        resync_dependents(work, cache, stacks, path);
        return;
    }

    if flags.did_add_inert_prim || flags.did_remove_inert_prim {
        // A structural-only edit rebuilds spec stacks in place, except when
        // the edited spec is the only remaining contributor: then the result
        // itself appears or disappears.
        let deps = Arc::clone(cache.dependency_index());
        for (id, _) in stacks {
            let mut targets = dependents(cache, id, path, false, true);
            if id == cache.root_identifier() {
                targets.push(path.clone());
            }
            for dep in targets {
                if deps.has_prim_index(&dep) && deps.prim_index_spec_count(&dep) <= 1 {
                    work.cache_changes.did_change_significantly.insert(dep);
                } else {
                    work.cache_changes.did_change_specs.insert(dep);
                }
            }
        }
    }
}

// =========================================================================
// Property entries
// =========================================================================

fn classify_property_entry(
    work: &mut CacheWork,
    cache: &Cache,
    stacks: &StackList,
    path: &ScenePath,
    entry: &ChangeEntry,
) {
    let flags = &entry.flags;

    // Property indexes only exist outside USD mode; there, structural
    // property edits invalidate the property's own composed result.
    if !cache.usd_mode() {
        if flags.did_add_property || flags.did_remove_property {
            resync_dependents(work, cache, stacks, path);
        } else if flags.did_add_property_with_only_required_fields
            || flags.did_remove_property_with_only_required_fields
        {
            for (id, _) in stacks {
                if id == cache.root_identifier() {
                    work.cache_changes.did_change_specs.insert(path.clone());
                }
                for dep in dependents(cache, id, path, false, true) {
                    work.cache_changes.did_change_specs.insert(dep);
                }
            }
        }

        let mut mask = 0;
        if flags.did_change_relationship_targets || flags.did_add_target || flags.did_remove_target
        {
            mask |= target_type::RELATIONSHIP_TARGETS;
        }
        if flags.did_change_attribute_connection {
            mask |= target_type::CONNECTIONS;
        }
        if mask != 0 {
            for (id, _) in stacks {
                if id == cache.root_identifier() {
                    *work.cache_changes.did_change_targets.entry(path.clone()).or_insert(0) |=
                        mask;
                }
                for dep in dependents(cache, id, path, false, true) {
                    *work.cache_changes.did_change_targets.entry(dep).or_insert(0) |= mask;
                }
            }
        }
    }

    for info in &entry.info_changed {
        if info.field == fields::DEFAULT {
            classify_dynamic_format_attribute(work, cache, stacks, path);
        }
    }
}

// =========================================================================
// Dynamic file formats
// =========================================================================

fn classify_dynamic_format_field(
    work: &mut CacheWork,
    cache: &Cache,
    stacks: &StackList,
    path: &ScenePath,
    field: &str,
    old: Option<&Value>,
    new: Option<&Value>,
) {
    let deps = Arc::clone(cache.dependency_index());
    if !deps.has_dynamic_format_field_dependencies() || !deps.is_possible_dynamic_format_field(field)
    {
        return;
    }
    for (id, _) in stacks {
        for dep in dependents(cache, id, path, false, true) {
            if deps.can_field_change_affect_format_arguments(&dep, field, old, new) {
                work.cache_changes.did_change_significantly.insert(dep);
            }
        }
    }
}

fn classify_dynamic_format_attribute(
    work: &mut CacheWork,
    cache: &Cache,
    stacks: &StackList,
    attribute_path: &ScenePath,
) {
    let deps = Arc::clone(cache.dependency_index());
    if !deps.has_dynamic_format_attribute_dependencies()
        || !deps.is_possible_dynamic_format_attribute(attribute_path.name())
    {
        return;
    }
    let prim_path = attribute_path.prim_path();
    for (id, _) in stacks {
        for dep in dependents(cache, id, &prim_path, false, true) {
            if deps.can_attribute_default_change_affect_format_arguments(&dep, attribute_path) {
                work.cache_changes.did_change_significantly.insert(dep);
            }
        }
    }
}

// =========================================================================
// Fan-out helpers
// =========================================================================

/// Index paths of results depending on `site_path` within one stack.
fn dependents(
    cache: &Cache,
    id: &LayerStackIdentifier,
    site_path: &ScenePath,
    recurse_on_site: bool,
    filter_existing_only: bool,
) -> Vec<ScenePath> {
    let mut out: Vec<ScenePath> = cache
        .dependency_index()
        .find_site_dependencies(
            id,
            site_path,
            dependency_type::ANY_NON_VIRTUAL,
            recurse_on_site,
            false,
            filter_existing_only,
        )
        .into_iter()
        .map(|dep| dep.index_path)
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Marks everything composed from `site_path` stale, in every given stack.
/// Recurses on the site so descendants relocated out of the subtree are
/// still caught.
fn resync_dependents(work: &mut CacheWork, cache: &Cache, stacks: &StackList, site_path: &ScenePath) {
    for (id, _) in stacks {
        resync_dependents_of(work, cache, id, site_path);
    }
}

fn resync_dependents_of(
    work: &mut CacheWork,
    cache: &Cache,
    id: &LayerStackIdentifier,
    site_path: &ScenePath,
) {
    if id == cache.root_identifier() {
        work.cache_changes
            .did_change_significantly
            .insert(site_path.clone());
    }
    for dep in dependents(cache, id, site_path, true, false) {
        work.cache_changes.did_change_significantly.insert(dep);
    }
}

/// Marks a whole stack's layer list as significantly changed.
pub(crate) fn mark_stack_significant(work: &mut CacheWork, cache: &Cache, id: &LayerStackIdentifier) {
    let flags = work.layer_stack_changes.entry(id.clone()).or_default();
    flags.mark_layers_changed();
    flags.did_change_significantly = true;
    resync_stack(work, cache, id);
}

fn resync_stack(work: &mut CacheWork, cache: &Cache, id: &LayerStackIdentifier) {
    resync_dependents_of(work, cache, id, &ScenePath::absolute_root());
}

/// True if re-resolving any recorded sublayer source would yield a path
/// other than the one the stack was built from. Expression-valued sources
/// are skipped; their resolution is variable-driven, not resolver-driven.
pub(crate) fn asset_paths_are_stale(stack: &LayerStack) -> bool {
    stack.sublayer_source_info().iter().any(|info| {
        !is_variable_expression(&info.authored_path)
            && resolve_asset_path(&info.layer.identifier(), &info.authored_path)
                != info.computed_path
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    use crate::cache::Cache;
    use crate::config::Config;
    use crate::deps::{Dependency, DependencyIndex, DependencyTypeMask, NoDependencies};
    use crate::layer::LayerRegistry;
    use crate::mapfn::MapFunction;
    use crate::offset::TimeOffset;

    /// Reports every queried site as depended on by a result at the same
    /// path, with configurable spec counts.
    struct MirrorDeps {
        has_index: bool,
        spec_count: usize,
    }

    impl DependencyIndex for MirrorDeps {
        fn find_site_dependencies(
            &self,
            _layer_stack: &LayerStackIdentifier,
            site_path: &ScenePath,
            _mask: DependencyTypeMask,
            _recurse_on_site: bool,
            _recurse_on_index: bool,
            _filter_existing_only: bool,
        ) -> Vec<Dependency> {
            vec![Dependency {
                index_path: site_path.clone(),
                site_path: site_path.clone(),
                map_function: MapFunction::identity(),
            }]
        }

        fn has_prim_index(&self, _path: &ScenePath) -> bool {
            self.has_index
        }

        fn prim_index_spec_count(&self, _path: &ScenePath) -> usize {
            self.spec_count
        }
    }

    /// Two results read the changed site through a dynamic file format, but
    /// only one of them built its format arguments from the edited field.
    struct SelectiveFormatDeps;

    impl DependencyIndex for SelectiveFormatDeps {
        fn find_site_dependencies(
            &self,
            _layer_stack: &LayerStackIdentifier,
            site_path: &ScenePath,
            _mask: DependencyTypeMask,
            _recurse_on_site: bool,
            _recurse_on_index: bool,
            _filter_existing_only: bool,
        ) -> Vec<Dependency> {
            [ScenePath::new("/WithArgs"), ScenePath::new("/WithoutArgs")]
                .into_iter()
                .map(|index_path| Dependency {
                    index_path,
                    site_path: site_path.clone(),
                    map_function: MapFunction::identity(),
                })
                .collect()
        }

        fn has_dynamic_format_field_dependencies(&self) -> bool {
            true
        }

        fn is_possible_dynamic_format_field(&self, field: &str) -> bool {
            field == "formatArg"
        }

        fn can_field_change_affect_format_arguments(
            &self,
            index_path: &ScenePath,
            _field: &str,
            _old: Option<&Value>,
            _new: Option<&Value>,
        ) -> bool {
            index_path == &ScenePath::new("/WithArgs")
        }
    }

    fn cache_with(deps: Arc<dyn DependencyIndex>) -> (Cache, Layer) {
        cache_with_mode(deps, true)
    }

    fn cache_with_mode(deps: Arc<dyn DependencyIndex>, usd_mode: bool) -> (Cache, Layer) {
        let layers = Arc::new(LayerRegistry::new());
        let root = layers.create("root.layer");
        let cache = Cache::new(
            LayerStackIdentifier::new(root.clone(), None),
            layers,
            deps,
            usd_mode,
            Config::default(),
        );
        cache.compute_root_layer_stack();
        (cache, root)
    }

    #[test]
    fn test_content_replace_is_significant() {
        let (cache, root) = cache_with(Arc::new(NoDependencies));
        let mut list = ChangeList::new();
        list.entry_mut(&ScenePath::absolute_root()).flags.did_replace_content = true;

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let stack_changes = changes.layer_stack_changes(&cache).unwrap();
        let flags = &stack_changes[cache.root_identifier()];
        assert!(flags.did_change_layers);
        assert!(flags.did_change_significantly);
        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes
            .did_change_significantly
            .contains(&ScenePath::absolute_root()));
    }

    #[test]
    fn test_inert_prim_edit_rebuilds_specs_only() {
        let (cache, root) = cache_with(Arc::new(MirrorDeps { has_index: true, spec_count: 3 }));
        let mut list = ChangeList::new();
        list.entry_mut(&ScenePath::new("/A")).flags.did_add_inert_prim = true;

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes.did_change_significantly.is_empty());
        assert!(cache_changes.did_change_specs.contains(&ScenePath::new("/A")));
    }

    #[test]
    fn test_inert_removal_of_last_spec_is_significant() {
        let (cache, root) = cache_with(Arc::new(MirrorDeps { has_index: true, spec_count: 0 }));
        let mut list = ChangeList::new();
        list.entry_mut(&ScenePath::new("/A")).flags.did_remove_inert_prim = true;

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes
            .did_change_significantly
            .contains(&ScenePath::new("/A")));
        assert!(cache_changes.did_change_specs.is_empty());
    }

    #[test]
    fn test_non_inert_prim_edit_is_significant() {
        let (cache, root) = cache_with(Arc::new(NoDependencies));
        let mut list = ChangeList::new();
        list.entry_mut(&ScenePath::new("/A")).flags.did_add_non_inert_prim = true;

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes
            .did_change_significantly
            .contains(&ScenePath::new("/A")));
    }

    #[test]
    fn test_default_prim_change_resyncs_both_prims() {
        let (cache, root) = cache_with(Arc::new(NoDependencies));
        let mut list = ChangeList::new();
        list.record_info_change(
            &ScenePath::absolute_root(),
            fields::DEFAULT_PRIM,
            Some(json!("Old")),
            Some(json!("New")),
        );

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes.did_change_significantly.contains(&ScenePath::new("/Old")));
        assert!(cache_changes.did_change_significantly.contains(&ScenePath::new("/New")));
        assert!(!cache_changes
            .did_change_significantly
            .contains(&ScenePath::absolute_root()));
    }

    #[test]
    fn test_rate_opinion_matching_fallback_is_not_offsets_change() {
        let (cache, root) = cache_with(Arc::new(NoDependencies));
        // Authoring 24 where the fallback already said 24 changes nothing.
        root.set_field(&ScenePath::absolute_root(), fields::TIME_CODES_PER_SECOND, json!(24.0));
        let mut list = ChangeList::new();
        list.record_info_change(
            &ScenePath::absolute_root(),
            fields::TIME_CODES_PER_SECOND,
            None,
            Some(json!(24.0)),
        );

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        assert!(
            changes
                .layer_stack_changes(&cache)
                .is_none_or(|m| m.values().all(|f| !f.did_change_layer_offsets))
        );
    }

    #[test]
    fn test_rate_change_marks_offsets() {
        let (cache, root) = cache_with(Arc::new(NoDependencies));
        root.set_field(&ScenePath::absolute_root(), fields::TIME_CODES_PER_SECOND, json!(48.0));
        let mut list = ChangeList::new();
        list.record_info_change(
            &ScenePath::absolute_root(),
            fields::TIME_CODES_PER_SECOND,
            None,
            Some(json!(48.0)),
        );

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let stack_changes = changes.layer_stack_changes(&cache).unwrap();
        let flags = &stack_changes[cache.root_identifier()];
        assert!(flags.did_change_layer_offsets);
        assert!(!flags.did_change_layers);
        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes
            .did_change_significantly
            .contains(&ScenePath::absolute_root()));
    }

    #[test]
    fn test_adding_empty_sublayer_is_not_significant() {
        let layers = Arc::new(LayerRegistry::new());
        let root = layers.create("root.layer");
        layers.create("empty.layer");
        let cache = Cache::new(
            LayerStackIdentifier::new(root.clone(), None),
            layers,
            Arc::new(NoDependencies),
            true,
            Config::default(),
        );
        cache.compute_root_layer_stack();

        root.push_sublayer("empty.layer", TimeOffset::identity());
        let mut list = ChangeList::new();
        list.record_sublayer_change("empty.layer", SublayerChange::Added);

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let stack_changes = changes.layer_stack_changes(&cache).unwrap();
        let flags = &stack_changes[cache.root_identifier()];
        assert!(flags.did_change_layers);
        assert!(!flags.did_change_significantly);
        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes.did_change_significantly.is_empty());
        assert!(cache_changes
            .did_change_specs
            .contains(&ScenePath::absolute_root()));
    }

    #[test]
    fn test_adding_unresolvable_sublayer_rebuilds_layers_only() {
        let (cache, root) = cache_with(Arc::new(NoDependencies));
        root.push_sublayer("missing.layer", TimeOffset::identity());
        let mut list = ChangeList::new();
        list.record_sublayer_change("missing.layer", SublayerChange::Added);

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        // An unopenable sublayer carries no opinions; the layer list still
        // rebuilds but nothing composes differently.
        let stack_changes = changes.layer_stack_changes(&cache).unwrap();
        let flags = &stack_changes[cache.root_identifier()];
        assert!(flags.did_change_layers);
        assert!(!flags.did_change_significantly);
        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes.did_change_significantly.is_empty());
    }

    #[test]
    fn test_target_and_connection_masks() {
        let (cache, root) = cache_with_mode(Arc::new(NoDependencies), false);
        let rel = ScenePath::new("/A.rel");
        let attr = ScenePath::new("/A.attr");
        let mut list = ChangeList::new();
        list.entry_mut(&rel).flags.did_change_relationship_targets = true;
        list.entry_mut(&attr).flags.did_change_attribute_connection = true;

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert_eq!(
            cache_changes.did_change_targets[&rel],
            target_type::RELATIONSHIP_TARGETS
        );
        assert_eq!(cache_changes.did_change_targets[&attr], target_type::CONNECTIONS);
    }

    #[test]
    fn test_target_edits_ignored_for_usd_caches() {
        let (cache, root) = cache_with(Arc::new(NoDependencies));
        let rel = ScenePath::new("/A.rel");
        let mut list = ChangeList::new();
        list.entry_mut(&rel).flags.did_change_relationship_targets = true;

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        // Property indexes are not computed in USD mode, so there is nothing
        // to invalidate for a target-list edit.
        assert!(changes
            .cache_changes(&cache)
            .is_none_or(|c| c.did_change_targets.is_empty()));
    }

    #[test]
    fn test_format_field_change_promotes_only_affected_results() {
        let (cache, root) = cache_with(Arc::new(SelectiveFormatDeps));
        let mut list = ChangeList::new();
        list.record_info_change(
            &ScenePath::new("/Model"),
            "formatArg",
            Some(json!(1)),
            Some(json!(2)),
        );

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        // Both results depend on the site, but only the one whose format
        // arguments read the field recomposes.
        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes
            .did_change_significantly
            .contains(&ScenePath::new("/WithArgs")));
        assert!(!cache_changes
            .did_change_significantly
            .contains(&ScenePath::new("/WithoutArgs")));
    }

    #[test]
    fn test_expression_variable_change_rebuilds_consuming_stack() {
        let layers = Arc::new(LayerRegistry::new());
        let root = layers.create("root.layer");
        let sub = layers.create("sub.layer");
        sub.create_prim_spec(&ScenePath::new("/S"));
        root.set_field(
            &ScenePath::absolute_root(),
            fields::EXPRESSION_VARIABLES,
            json!({"which": "sub.layer"}),
        );
        root.push_sublayer("${which}", TimeOffset::identity());
        let cache = Cache::new(
            LayerStackIdentifier::new(root.clone(), None),
            layers,
            Arc::new(NoDependencies),
            true,
            Config::default(),
        );
        let stack = cache.compute_root_layer_stack();
        assert!(stack.read().has_layer(&sub));

        root.set_field(
            &ScenePath::absolute_root(),
            fields::EXPRESSION_VARIABLES,
            json!({"which": "other.layer"}),
        );
        let mut list = ChangeList::new();
        list.record_info_change(
            &ScenePath::absolute_root(),
            fields::EXPRESSION_VARIABLES,
            Some(json!({"which": "sub.layer"})),
            Some(json!({"which": "other.layer"})),
        );

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let stack_changes = changes.layer_stack_changes(&cache).unwrap();
        let flags = &stack_changes[cache.root_identifier()];
        assert!(flags.did_change_expression_variables);
        assert!(flags.did_change_layers);
        assert!(flags.did_change_significantly);
    }

    #[test]
    fn test_relocates_metadata_change_diffs_tables() {
        let layers = Arc::new(LayerRegistry::new());
        let root = layers.create("root.layer");
        root.create_prim_spec(&ScenePath::new("/Root/A"));
        let cache = Cache::new(
            LayerStackIdentifier::new(root.clone(), None),
            layers,
            Arc::new(NoDependencies),
            true,
            Config::default(),
        );
        cache.compute_root_layer_stack();

        root.set_layer_relocates(&[(ScenePath::new("/Root/A"), ScenePath::new("/Root/B"))]);
        let mut list = ChangeList::new();
        list.record_info_change(
            &ScenePath::absolute_root(),
            fields::LAYER_RELOCATES,
            None,
            Some(root.field(&ScenePath::absolute_root(), fields::LAYER_RELOCATES).unwrap()),
        );

        let mut changes = super::super::Changes::new();
        changes.did_change(&cache, &[(root, list)]);

        let stack_changes = changes.layer_stack_changes(&cache).unwrap();
        let flags = &stack_changes[cache.root_identifier()];
        assert!(flags.did_change_relocates);
        assert!(flags
            .paths_affected_by_relocation_changes
            .contains(&ScenePath::new("/Root/A")));
        assert!(flags
            .paths_affected_by_relocation_changes
            .contains(&ScenePath::new("/Root/B")));
        let cache_changes = changes.cache_changes(&cache).unwrap();
        assert!(cache_changes
            .did_change_significantly
            .contains(&ScenePath::new("/Root/A")));
    }
}
