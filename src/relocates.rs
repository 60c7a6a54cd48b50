//! Relocation resolution.
//!
//! Gathers every relocation authored across a layer stack, validates the set,
//! chains ancestral relocations back to their origin sources, and produces
//! four maps: the fully-resolved source→target map, its inverse, and the
//! one-hop ("incremental") pair as authored. Conflicting entries are demoted
//! to errors and dropped; the surviving maps are always mutually consistent
//! bidirectional inverses.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{ComposeError, InvalidRelocation, RelocationConflict, sort_errors};
use crate::layer::Layer;
use crate::path::ScenePath;

// =========================================================================
// Inputs and outputs
// =========================================================================

/// One relocation statement as authored, with its authoring site.
#[derive(Debug, Clone)]
pub struct AuthoredRelocate {
    /// The layer that authors the statement.
    pub layer: Layer,
    /// The path the statement is authored at (`/` for layer metadata).
    pub owning_path: ScenePath,
    /// Authored source path.
    pub source: ScenePath,
    /// Authored target path.
    pub target: ScenePath,
}

/// The derived relocation maps for one layer stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationTables {
    /// Fully-resolved origin source → target.
    pub source_to_target: BTreeMap<ScenePath, ScenePath>,
    /// Inverse of [`RelocationTables::source_to_target`].
    pub target_to_source: BTreeMap<ScenePath, ScenePath>,
    /// One-hop source → target, as authored.
    pub incremental_source_to_target: BTreeMap<ScenePath, ScenePath>,
    /// Inverse of the incremental map.
    pub incremental_target_to_source: BTreeMap<ScenePath, ScenePath>,
    /// Prim paths that author legacy relocation fields, sorted.
    pub authored_prim_paths: Vec<ScenePath>,
}

impl RelocationTables {
    /// True if no relocations survived resolution.
    pub fn is_empty(&self) -> bool {
        self.source_to_target.is_empty() && self.incremental_source_to_target.is_empty()
    }

    /// The (source, target) pairs whose targets lie under `path`, with fully
    /// resolved entries taking precedence over incremental ones that claim
    /// the same target. The result stays invertible.
    pub fn filter_for_path(&self, path: &ScenePath) -> Vec<(ScenePath, ScenePath)> {
        let mut pairs: Vec<(ScenePath, ScenePath)> = self
            .source_to_target
            .iter()
            .filter(|(_, target)| target.has_prefix(path))
            .map(|(s, t)| (s.clone(), t.clone()))
            .collect();
        for (source, target) in &self.incremental_source_to_target {
            if target.has_prefix(path) && !pairs.iter().any(|(_, t)| t == target) {
                pairs.push((source.clone(), target.clone()));
            }
        }
        pairs.sort();
        pairs
    }

    /// The paths at which the full source→target maps of `self` and `other`
    /// differ, as sorted unique sources and targets of differing entries.
    pub fn changed_paths(&self, other: &RelocationTables) -> Vec<ScenePath> {
        let mut paths = Vec::new();
        for (source, target) in &self.source_to_target {
            if other.source_to_target.get(source) != Some(target) {
                paths.push(source.clone());
                paths.push(target.clone());
            }
        }
        for (source, target) in &other.source_to_target {
            if self.source_to_target.get(source) != Some(target) {
                paths.push(source.clone());
                paths.push(target.clone());
            }
        }
        paths.sort();
        paths.dedup();
        paths
    }
}

// =========================================================================
// Collection
// =========================================================================

/// Gathers every relocation authored in `layers` (given strongest first).
///
/// A layer's modern layer-level relocation metadata shadows its legacy
/// per-prim fields; the legacy namespace walk only runs when no layer
/// metadata is present and the stack is not USD-only.
pub fn collect_relocates(layers: &[Layer], usd_mode: bool) -> Vec<AuthoredRelocate> {
    let mut authored = Vec::new();
    for layer in layers {
        if let Some(pairs) = layer.layer_relocates() {
            for (source, target) in pairs {
                authored.push(AuthoredRelocate {
                    layer: layer.clone(),
                    owning_path: ScenePath::absolute_root(),
                    source,
                    target,
                });
            }
        } else if !usd_mode {
            for prim in layer.prim_spec_paths() {
                if let Some(pairs) = layer.relocates_at(&prim) {
                    for (source, target) in pairs {
                        authored.push(AuthoredRelocate {
                            layer: layer.clone(),
                            owning_path: prim.clone(),
                            source,
                            target,
                        });
                    }
                }
            }
        }
    }
    authored
}

// =========================================================================
// Resolution
// =========================================================================

/// Resolves all relocations authored across `layers` into consistent maps.
///
/// `legacy` relaxes the double-move and moved-subtree conflict checks and
/// enables source conforming, matching historical non-USD behavior.
/// Idempotent: the same layers always produce the same maps and the same
/// sorted error list.
pub fn resolve_layer_stack_relocations(
    layers: &[Layer],
    usd_mode: bool,
    legacy: bool,
    errors: &mut Vec<ComposeError>,
) -> RelocationTables {
    let authored = collect_relocates(layers, usd_mode);
    resolve_relocations(&authored, legacy && !usd_mode, errors)
}

/// Resolves an explicit list of authored relocations. See
/// [`resolve_layer_stack_relocations`].
pub fn resolve_relocations(
    authored: &[AuthoredRelocate],
    legacy: bool,
    errors: &mut Vec<ComposeError>,
) -> RelocationTables {
    let mut local_errors = Vec::new();
    let mut tables = RelocationTables::default();

    for entry in authored {
        if !entry.owning_path.is_absolute_root() {
            tables.authored_prim_paths.push(entry.owning_path.clone());
        }
    }
    tables.authored_prim_paths.sort();
    tables.authored_prim_paths.dedup();

    // First writer for a given source wins; layers were given strongest
    // first.
    let mut claimed_sources = FxHashSet::default();
    let mut entries: Vec<AuthoredRelocate> = Vec::new();
    for entry in authored {
        if claimed_sources.insert(entry.source.clone()) {
            entries.push(entry.clone());
        }
    }

    entries.retain(|entry| match validate_pair(&entry.source, &entry.target) {
        None => true,
        Some(reason) => {
            local_errors.push(ComposeError::InvalidAuthoredRelocation {
                layer: entry.layer.identifier(),
                owning_path: entry.owning_path.clone(),
                source_path: entry.source.clone(),
                target: entry.target.clone(),
                reason,
            });
            false
        }
    });

    reject_same_target(&mut entries, &mut local_errors);
    if !legacy {
        reject_conflicts(&mut entries, &mut local_errors);
    } else {
        conform_legacy_sources(&mut entries);
    }

    for entry in &entries {
        tables
            .incremental_source_to_target
            .insert(entry.source.clone(), entry.target.clone());
        tables
            .incremental_target_to_source
            .insert(entry.target.clone(), entry.source.clone());
    }

    // Chain each source back through ancestor targets to its origin, so the
    // full map speaks in fully unrelocated source paths.
    for entry in &entries {
        let origin = chain_origin(&entry.source, &tables.incremental_target_to_source);
        tables.source_to_target.insert(origin.clone(), entry.target.clone());
        tables.target_to_source.insert(entry.target.clone(), origin);
    }

    sort_errors(&mut local_errors);
    errors.extend(local_errors);
    tables
}

fn validate_pair(source: &ScenePath, target: &ScenePath) -> Option<InvalidRelocation> {
    for path in [source, target] {
        if path.contains_variant_selection() {
            return Some(InvalidRelocation::VariantSelection);
        }
        if !path.is_prim_path() {
            return Some(InvalidRelocation::NotAPrimPath);
        }
        if path.parent().is_none_or(|p| p.is_absolute_root()) {
            return Some(InvalidRelocation::RootPath);
        }
    }
    if source.has_prefix(target) {
        return Some(InvalidRelocation::TargetIsSelfOrAncestor);
    }
    if target.has_prefix(source) {
        return Some(InvalidRelocation::TargetIsDescendant);
    }
    if source.root_prim() != target.root_prim() {
        return Some(InvalidRelocation::CrossesRootPrims);
    }
    None
}

/// Drops every group of relocations that claims the same target, emitting one
/// grouped error per contested target.
fn reject_same_target(entries: &mut Vec<AuthoredRelocate>, errors: &mut Vec<ComposeError>) {
    let mut by_target: FxHashMap<ScenePath, Vec<usize>> = FxHashMap::default();
    for (i, entry) in entries.iter().enumerate() {
        by_target.entry(entry.target.clone()).or_default().push(i);
    }
    let mut dropped = FxHashSet::default();
    for (target, indexes) in by_target {
        if indexes.len() < 2 {
            continue;
        }
        let mut sources: Vec<(ScenePath, String)> = indexes
            .iter()
            .map(|&i| (entries[i].source.clone(), entries[i].layer.identifier()))
            .collect();
        sources.sort();
        errors.push(ComposeError::SameTargetRelocates { target, sources });
        dropped.extend(indexes);
    }
    retain_unflagged(entries, &dropped);
}

/// Rejects double-moves and relocations under moved-away subtrees.
///
/// Chaining through ancestor *targets* stays legal; origin computation
/// depends on it.
fn reject_conflicts(entries: &mut Vec<AuthoredRelocate>, errors: &mut Vec<ComposeError>) {
    let mut flagged = FxHashSet::default();
    for (i, entry) in entries.iter().enumerate() {
        for (j, other) in entries.iter().enumerate() {
            if i == j {
                continue;
            }
            let conflict = if entry.target == other.source {
                Some(RelocationConflict::TargetIsAnotherSource)
            } else if entry.source != other.source && entry.source.has_prefix(&other.source) {
                Some(RelocationConflict::SourceUnderMovedSubtree)
            } else if entry.target != other.source && entry.target.has_prefix(&other.source) {
                Some(RelocationConflict::TargetUnderMovedSubtree)
            } else {
                None
            };
            if let Some(conflict) = conflict {
                errors.push(ComposeError::ConflictingRelocation {
                    source_path: entry.source.clone(),
                    target: entry.target.clone(),
                    conflict,
                    other_source: other.source.clone(),
                    other_target: other.target.clone(),
                });
                flagged.insert(i);
                if conflict == RelocationConflict::TargetIsAnotherSource {
                    flagged.insert(j);
                }
                break;
            }
        }
    }
    retain_unflagged(entries, &flagged);
}

/// Rewrites legacy sources to their most-relocated form: any ancestor that is
/// itself relocated is expressed through its target. First claimant wins when
/// two authored sources collapse to one conformed source.
fn conform_legacy_sources(entries: &mut Vec<AuthoredRelocate>) {
    let forward: FxHashMap<ScenePath, ScenePath> = entries
        .iter()
        .map(|e| (e.source.clone(), e.target.clone()))
        .collect();
    let mut claimed: FxHashMap<ScenePath, ScenePath> = FxHashMap::default();
    let mut kept = Vec::with_capacity(entries.len());
    for mut entry in entries.drain(..) {
        let mut conformed = entry.source.clone();
        for _ in 0..=forward.len() {
            let Some((ancestor, target)) = conformed
                .ancestors()
                .skip(1)
                .find_map(|a| forward.get(&a).map(|t| (a, t.clone())))
            else {
                break;
            };
            conformed = conformed.replace_prefix(&ancestor, &target);
        }
        match claimed.get(&conformed) {
            Some(existing_target) => {
                if existing_target != &entry.target {
                    tracing::warn!(
                        source = %entry.source,
                        conformed = %conformed,
                        kept_target = %existing_target,
                        dropped_target = %entry.target,
                        "relocation sources conform to the same path with different targets"
                    );
                }
            }
            None => {
                claimed.insert(conformed.clone(), entry.target.clone());
                entry.source = conformed;
                kept.push(entry);
            }
        }
    }
    *entries = kept;
}

/// Walks `path`'s ancestors through the target→source map until no ancestor
/// is a relocation target, yielding the fully unrelocated origin.
fn chain_origin(path: &ScenePath, target_to_source: &BTreeMap<ScenePath, ScenePath>) -> ScenePath {
    let mut origin = path.clone();
    // Each rewrite steps strictly backward through the authored set; the
    // bound guards against cycles that legacy mode can let through.
    for _ in 0..=target_to_source.len() {
        let Some((ancestor, source)) = origin
            .ancestors()
            .skip(1)
            .find_map(|a| target_to_source.get(&a).map(|s| (a, s.clone())))
        else {
            return origin;
        };
        origin = origin.replace_prefix(&ancestor, &source);
    }
    origin
}

fn retain_unflagged(entries: &mut Vec<AuthoredRelocate>, flagged: &FxHashSet<usize>) {
    let mut index = 0;
    entries.retain(|_| {
        let keep = !flagged.contains(&index);
        index += 1;
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relocate(layer: &Layer, source: &str, target: &str) -> AuthoredRelocate {
        AuthoredRelocate {
            layer: layer.clone(),
            owning_path: ScenePath::absolute_root(),
            source: ScenePath::new(source),
            target: ScenePath::new(target),
        }
    }

    #[test]
    fn test_bijection_and_idempotence() {
        let layer = Layer::new("a.layer");
        let authored = vec![
            relocate(&layer, "/Root/A", "/Root/B"),
            relocate(&layer, "/Root/B/C", "/Root/B/D"),
        ];
        let mut errors = Vec::new();
        let first = resolve_relocations(&authored, false, &mut errors);
        assert!(errors.is_empty());
        for (source, target) in &first.source_to_target {
            assert_eq!(first.target_to_source.get(target), Some(source));
        }
        let second = resolve_relocations(&authored, false, &mut errors);
        assert!(errors.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_origin_chaining() {
        let layer = Layer::new("a.layer");
        let authored = vec![
            relocate(&layer, "/Root/A", "/Root/B"),
            relocate(&layer, "/Root/B/C", "/Root/B/D"),
        ];
        let mut errors = Vec::new();
        let tables = resolve_relocations(&authored, false, &mut errors);
        assert!(errors.is_empty());
        // The chained entry's origin is expressed in terms of the
        // pre-relocation namespace.
        assert_eq!(
            tables.source_to_target.get(&ScenePath::new("/Root/A/C")),
            Some(&ScenePath::new("/Root/B/D"))
        );
        assert_eq!(
            tables.target_to_source.get(&ScenePath::new("/Root/B/D")),
            Some(&ScenePath::new("/Root/A/C"))
        );
        // The incremental map stays one-hop.
        assert_eq!(
            tables.incremental_source_to_target.get(&ScenePath::new("/Root/B/C")),
            Some(&ScenePath::new("/Root/B/D"))
        );
    }

    #[test]
    fn test_same_target_rejected_as_group() {
        let layer = Layer::new("a.layer");
        let authored = vec![
            relocate(&layer, "/Root/A", "/Root/T"),
            relocate(&layer, "/Root/B", "/Root/T"),
        ];
        let mut errors = Vec::new();
        let tables = resolve_relocations(&authored, false, &mut errors);
        assert!(tables.source_to_target.is_empty());
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            ComposeError::SameTargetRelocates { target, sources } => {
                assert_eq!(target.text(), "/Root/T");
                assert_eq!(sources.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_double_move_rejected() {
        let layer = Layer::new("a.layer");
        let authored = vec![
            relocate(&layer, "/Root/A", "/Root/B"),
            relocate(&layer, "/Root/B", "/Root/C"),
        ];
        let mut errors = Vec::new();
        let tables = resolve_relocations(&authored, false, &mut errors);
        assert!(tables.source_to_target.is_empty());
        assert!(errors.iter().any(|e| matches!(
            e,
            ComposeError::ConflictingRelocation {
                conflict: RelocationConflict::TargetIsAnotherSource,
                ..
            }
        )));
    }

    #[test]
    fn test_moved_subtree_rejected() {
        let layer = Layer::new("a.layer");
        let authored = vec![
            relocate(&layer, "/Root/A", "/Root/B"),
            relocate(&layer, "/Root/A/X", "/Root/Y"),
        ];
        let mut errors = Vec::new();
        let tables = resolve_relocations(&authored, false, &mut errors);
        // Only the subtree-straddling entry is dropped.
        assert_eq!(
            tables.source_to_target.get(&ScenePath::new("/Root/A")),
            Some(&ScenePath::new("/Root/B"))
        );
        assert!(!tables.source_to_target.contains_key(&ScenePath::new("/Root/A/X")));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_invalid_pairs() {
        let layer = Layer::new("a.layer");
        let mut errors = Vec::new();
        let authored = vec![
            relocate(&layer, "/Root/A", "/Root/A/B"),
            relocate(&layer, "/Root", "/Other"),
            relocate(&layer, "/Root/A", "/Other/B"),
        ];
        let tables = resolve_relocations(&authored, false, &mut errors);
        assert!(tables.is_empty());
        // The third entry repeats the source /Root/A and is shadowed by the
        // first before validation runs, so it contributes no error.
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_legacy_conform() {
        let layer = Layer::new("a.layer");
        // /Root/A is moved to /Root/B; a second relocation still speaks of a
        // child under the old location.
        let authored = vec![
            relocate(&layer, "/Root/A", "/Root/B"),
            relocate(&layer, "/Root/A/X", "/Root/B/Y"),
        ];
        let mut errors = Vec::new();
        let tables = resolve_relocations(&authored, true, &mut errors);
        assert!(errors.is_empty());
        assert_eq!(
            tables.incremental_source_to_target.get(&ScenePath::new("/Root/B/X")),
            Some(&ScenePath::new("/Root/B/Y"))
        );
    }

    #[test]
    fn test_collection_first_source_wins_and_shadowing() {
        let strong = Layer::new("strong.layer");
        strong.set_layer_relocates(&[(ScenePath::new("/Root/A"), ScenePath::new("/Root/B"))]);
        let weak = Layer::new("weak.layer");
        weak.set_layer_relocates(&[(ScenePath::new("/Root/A"), ScenePath::new("/Root/C"))]);
        let mut errors = Vec::new();
        let tables = resolve_layer_stack_relocations(
            &[strong.clone(), weak.clone()],
            true,
            false,
            &mut errors,
        );
        assert!(errors.is_empty());
        assert_eq!(
            tables.source_to_target.get(&ScenePath::new("/Root/A")),
            Some(&ScenePath::new("/Root/B"))
        );
    }

    #[test]
    fn test_filter_precedence() {
        let layer = Layer::new("a.layer");
        let authored = vec![
            relocate(&layer, "/Root/A", "/Root/B"),
            relocate(&layer, "/Root/B/C", "/Root/B/D"),
        ];
        let mut errors = Vec::new();
        let tables = resolve_relocations(&authored, false, &mut errors);
        let pairs = tables.filter_for_path(&ScenePath::new("/Root/B"));
        // /Root/B/D appears once, with the fully resolved source.
        let for_target: Vec<&ScenePath> = pairs
            .iter()
            .filter(|(_, t)| t.text() == "/Root/B/D")
            .map(|(s, _)| s)
            .collect();
        assert_eq!(for_target, vec![&ScenePath::new("/Root/A/C")]);
    }
}
