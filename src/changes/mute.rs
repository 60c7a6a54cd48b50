//! Muting and external-resolution changes.
//!
//! Muting a layer is a diff against an empty document pushed through the
//! ordinary classification pipeline, so a muted layer invalidates exactly
//! what its opinions touched. Layers that cannot take the minimal path (not
//! open, or carrying relocations that change whole-stack tables) fall back
//! to a significant change of every stack that composes them.

use super::classify::{self, mark_stack_significant};
use super::Changes;
use crate::cache::{Cache, MutedLayers};
use crate::layer::{ChangeList, Layer, resolve_asset_path};

impl Changes {
    /// Queues mute and unmute requests for `cache`. Paths may be relative;
    /// they are anchored to the cache's root layer. The muted set itself
    /// only changes when the batch is applied.
    pub fn did_mute_and_unmute_layers(
        &mut self,
        cache: &Cache,
        to_mute: &[String],
        to_unmute: &[String],
    ) {
        let anchor = cache.root_identifier().root_layer.identifier();
        for path in to_mute {
            let canonical = MutedLayers::canonical(&anchor, path);
            if canonical == anchor {
                tracing::warn!(layer = %canonical, "cannot mute the cache's root layer");
                continue;
            }
            self.work_for(cache)
                .cache_changes
                .layers_to_mute
                .push(canonical.clone());
            self.mute_transition(cache, &canonical, true);
        }
        for path in to_unmute {
            let canonical = MutedLayers::canonical(&anchor, path);
            self.work_for(cache)
                .cache_changes
                .layers_to_unmute
                .push(canonical.clone());
            self.mute_transition(cache, &canonical, false);
        }
    }

    fn mute_transition(&mut self, cache: &Cache, canonical: &str, muting: bool) {
        let layer = cache.provider().find(canonical);
        let affected = if muting {
            match &layer {
                Some(layer) => cache.layer_stacks().stacks_using_layer(layer),
                // Never opened: the only composed state touching it is the
                // unresolvable-sublayer error, so the stacks naming its path
                // rebuild their layer lists and nothing else.
                None => cache
                    .layer_stacks()
                    .all()
                    .into_iter()
                    .filter(|(_, stack)| {
                        stack
                            .read()
                            .sublayer_source_info()
                            .iter()
                            .any(|info| info.computed_path == canonical)
                    })
                    .collect(),
            }
        } else {
            cache.layer_stacks().stacks_using_muted_layer(canonical)
        };
        if affected.is_empty() {
            return;
        }

        let Some(layer) = layer else {
            let work = self.work_for(cache);
            for (id, _) in &affected {
                work.layer_stack_changes
                    .entry(id.clone())
                    .or_default()
                    .mark_layers_changed();
            }
            return;
        };

        // Relocations are whole-stack state; a diff of one layer's entries
        // cannot bound their effect.
        let minimal = cache.config().minimal_mute_changes && !layer.has_any_relocates();
        if minimal {
            let work = self.work_for(cache);
            for (id, _) in &affected {
                work.layer_stack_changes
                    .entry(id.clone())
                    .or_default()
                    .mark_layers_changed();
            }
            let list = if muting {
                ChangeList::diff_to_empty(&layer)
            } else {
                ChangeList::diff_from_empty(&layer)
            };
            self.classify_layer_changes_in(cache, &layer, &list, &affected);
        } else {
            for (id, _) in &affected {
                let work = self.work_for(cache);
                mark_stack_significant(work, cache, id);
            }
        }
        self.lifeboat.retain_layer(layer);
    }

    /// Re-examines one authored sublayer path after an external event (the
    /// asset appeared on disk, say). Stacks that authored the path but do
    /// not compose the layer it now resolves to change significantly.
    pub fn did_maybe_fix_sublayer(&mut self, cache: &Cache, layer: &Layer, authored_path: &str) {
        let resolved = resolve_asset_path(&layer.identifier(), authored_path);
        let Some(sublayer) = cache.with_context(|ctx| ctx.provider.find_or_open(&resolved)) else {
            return;
        };
        for (id, stack) in cache.layer_stacks().stacks_using_layer(layer) {
            let guard = stack.read();
            let authored_here = guard
                .sublayer_source_info()
                .iter()
                .any(|info| info.layer == *layer && info.authored_path == authored_path);
            let needs_recompute = authored_here && !guard.has_layer(&sublayer);
            drop(guard);
            if needs_recompute {
                let work = self.work_for(cache);
                mark_stack_significant(work, cache, &id);
            }
        }
    }

    /// As [`Changes::did_maybe_fix_sublayer`], but keyed by resolved asset
    /// path across every stack in the cache.
    pub fn did_maybe_fix_asset(&mut self, cache: &Cache, asset_path: &str) {
        let Some(opened) = cache.with_context(|ctx| ctx.provider.find_or_open(asset_path)) else {
            return;
        };
        for (id, stack) in cache.layer_stacks().all() {
            let guard = stack.read();
            let needs_recompute = guard
                .sublayer_source_info()
                .iter()
                .any(|info| info.computed_path == asset_path)
                && !guard.has_layer(&opened);
            drop(guard);
            if needs_recompute {
                let work = self.work_for(cache);
                mark_stack_significant(work, cache, &id);
            }
        }
    }

    /// Reacts to a wholesale change in path resolution: every stack whose
    /// recorded sublayer sources now resolve differently changes
    /// significantly.
    pub fn did_change_asset_resolver(&mut self, cache: &Cache) {
        for (id, stack) in cache.layer_stacks().all() {
            let stale = classify::asset_paths_are_stale(&stack.read());
            let work = self.work_for(cache);
            work.layer_stack_changes
                .entry(id.clone())
                .or_default()
                .did_change_resolved_paths = true;
            if stale {
                mark_stack_significant(work, cache, &id);
            }
        }
    }
}
