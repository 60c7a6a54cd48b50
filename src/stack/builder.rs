//! Recursive sublayer resolution.
//!
//! Walks a root (and session) layer's sublayer graph depth-first, evaluating
//! expression paths, skipping muted layers, validating offsets, scaling by
//! layer time rates, and detecting cycles. Sibling opens may run in parallel;
//! tree assembly is always single-threaded so strength order is exact.

use std::collections::BTreeSet;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::cache::MutedLayers;
use crate::error::{ComposeError, sort_errors};
use crate::layer::{Layer, fields, resolve_asset_path};
use crate::mapfn::MapFunction;
use crate::offset::{FALLBACK_TIME_CODES_PER_SECOND, TimeOffset};
use crate::path::ScenePath;
use crate::stack::{
    LayerStackContext, LayerStackIdentifier, LayerTree, SublayerSourceInfo,
    effective_time_codes_per_second,
};
use crate::vars::{ExpressionVariables, evaluate_string_expression, is_variable_expression};

pub(crate) struct BuildResult {
    pub layers: Vec<Layer>,
    pub map_functions: Vec<MapFunction>,
    pub layer_tree: Option<Arc<LayerTree>>,
    pub session_layer_tree: Option<Arc<LayerTree>>,
    pub muted_layers: BTreeSet<String>,
    pub sublayer_source_info: Vec<SublayerSourceInfo>,
    pub used_expression_variables: BTreeSet<String>,
    pub time_codes_per_second: f64,
    pub errors: Vec<ComposeError>,
}

struct BuildState<'a> {
    ctx: &'a LayerStackContext<'a>,
    vars: &'a ExpressionVariables,
    ancestors: Vec<Layer>,
    muted_layers: BTreeSet<String>,
    sublayer_source_info: Vec<SublayerSourceInfo>,
    used_expression_variables: BTreeSet<String>,
    errors: Vec<ComposeError>,
}

pub(crate) fn build(
    identifier: &LayerStackIdentifier,
    vars: &ExpressionVariables,
    ctx: &LayerStackContext<'_>,
) -> BuildResult {
    let time_codes_per_second = effective_time_codes_per_second(identifier);
    let mut state = BuildState {
        ctx,
        vars,
        ancestors: Vec::new(),
        muted_layers: BTreeSet::new(),
        sublayer_source_info: Vec::new(),
        used_expression_variables: BTreeSet::new(),
        errors: Vec::new(),
    };

    let session_layer_tree = identifier.session_layer.as_ref().and_then(|session| {
        let canonical = MutedLayers::canonical(
            &identifier.root_layer.identifier(),
            &session.identifier(),
        );
        if ctx.muted.is_muted(&canonical) {
            state.muted_layers.insert(canonical);
            return None;
        }
        Some(build_subtree(
            session.clone(),
            TimeOffset::identity(),
            time_codes_per_second,
            &mut state,
        ))
    });

    let mut layer_tree = build_subtree(
        identifier.root_layer.clone(),
        TimeOffset::identity(),
        time_codes_per_second,
        &mut state,
    );
    layer_tree = apply_owned_sublayer_order(identifier, layer_tree, &mut state);

    let mut layers = Vec::new();
    let mut map_functions = Vec::new();
    if let Some(tree) = &session_layer_tree {
        tree.flatten(&mut layers, &mut map_functions);
    }
    layer_tree.flatten(&mut layers, &mut map_functions);

    sort_errors(&mut state.errors);
    BuildResult {
        layers,
        map_functions,
        layer_tree: Some(layer_tree),
        session_layer_tree,
        muted_layers: state.muted_layers,
        sublayer_source_info: state.sublayer_source_info,
        used_expression_variables: state.used_expression_variables,
        time_codes_per_second,
        errors: state.errors,
    }
}

/// Builds the subtree rooted at `layer`. `cumulative` maps this layer's times
/// into the stack root's timeline; `rate` is the time rate children scale
/// against.
fn build_subtree(
    layer: Layer,
    cumulative: TimeOffset,
    rate: f64,
    state: &mut BuildState<'_>,
) -> Arc<LayerTree> {
    state.ancestors.push(layer.clone());
    let identifier = layer.identifier();
    let authored_paths = layer.sublayer_paths();
    let authored_offsets = layer.sublayer_offsets();

    // Resolve every authored path first so sibling opens can run together.
    let mut pending: Vec<(String, TimeOffset)> = Vec::new();
    for (i, authored) in authored_paths.iter().enumerate() {
        let evaluated = if is_variable_expression(authored) {
            match evaluate_string_expression(authored, state.vars.variables()) {
                Ok(out) => {
                    state.used_expression_variables.extend(out.used_variables);
                    out.value
                }
                Err(message) => {
                    state.errors.push(ComposeError::ExpressionEvaluation {
                        layer: identifier.clone(),
                        expression: authored.clone(),
                        message,
                    });
                    continue;
                }
            }
        } else {
            authored.clone()
        };

        let computed = resolve_asset_path(&identifier, &evaluated);
        state.sublayer_source_info.push(SublayerSourceInfo {
            layer: layer.clone(),
            authored_path: authored.clone(),
            computed_path: computed.clone(),
        });
        if state.ctx.muted.is_muted(&computed) {
            state.muted_layers.insert(computed);
            continue;
        }

        let mut offset = authored_offsets.get(i).copied().unwrap_or_default();
        if !offset.is_valid() {
            state.errors.push(ComposeError::InvalidSublayerOffset {
                layer: identifier.clone(),
                sublayer: computed.clone(),
                offset,
            });
            offset = TimeOffset::identity();
        }
        pending.push((computed, offset));
    }

    let opened = open_siblings(&pending, state.ctx);

    let mut children = Vec::new();
    for ((computed, authored_offset), sublayer) in pending.into_iter().zip(opened) {
        let Some(sublayer) = sublayer else {
            state.errors.push(ComposeError::InvalidSublayerPath {
                layer: identifier.clone(),
                sublayer_path: computed,
            });
            continue;
        };
        if state.ancestors.contains(&sublayer) {
            state.errors.push(ComposeError::SublayerCycle {
                layer: identifier.clone(),
                sublayer: computed,
            });
            continue;
        }

        let mut offset = authored_offset;
        let sublayer_rate = sublayer.time_codes_per_second();
        if state.ctx.config.scale_offsets_by_tcps && rate != sublayer_rate {
            offset.scale *= valid_rate(rate) / valid_rate(sublayer_rate);
        }

        children.push(build_subtree(sublayer, cumulative * offset, sublayer_rate, state));
    }

    state.ancestors.pop();
    LayerTree::new(layer, cumulative, children)
}

/// An authored time rate of zero (or worse) would bake a degenerate scale
/// into every map function below it; substitute the fallback rate instead.
fn valid_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        FALLBACK_TIME_CODES_PER_SECOND
    }
}

/// Opens sibling sublayers, concurrently when the cache's layers are declared
/// safe to open in parallel.
fn open_siblings(
    pending: &[(String, TimeOffset)],
    ctx: &LayerStackContext<'_>,
) -> Vec<Option<Layer>> {
    #[cfg(feature = "parallel")]
    if ctx.config.parallel_sublayer_prefetch && ctx.usd_mode && pending.len() > 1 {
        return pending
            .par_iter()
            .map(|(path, _)| ctx.provider.find_or_open(path))
            .collect();
    }
    pending
        .iter()
        .map(|(path, _)| ctx.provider.find_or_open(path))
        .collect()
}

/// Stably moves the root layer's session-owned sublayers to the front of
/// their sibling list. More than one owned sibling is reported but does not
/// block composition.
fn apply_owned_sublayer_order(
    identifier: &LayerStackIdentifier,
    tree: Arc<LayerTree>,
    state: &mut BuildState<'_>,
) -> Arc<LayerTree> {
    let root_path = ScenePath::absolute_root();
    let has_owned = identifier
        .root_layer
        .field(&root_path, fields::HAS_OWNED_SUBLAYERS)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !has_owned {
        return tree;
    }
    let Some(owner) = identifier
        .session_layer
        .as_ref()
        .and_then(|s| s.field(&root_path, fields::SESSION_OWNER))
        .and_then(|v| v.as_str().map(str::to_owned))
    else {
        return tree;
    };

    let (owned, rest): (Vec<_>, Vec<_>) = tree
        .children()
        .iter()
        .cloned()
        .partition(|child| {
            child
                .layer()
                .field(&root_path, fields::OWNER)
                .and_then(|v| v.as_str().map(str::to_owned))
                .as_deref()
                == Some(owner.as_str())
        });

    if owned.len() > 1 {
        state.errors.push(ComposeError::InvalidSublayerOwnership {
            layer: identifier.root_layer.identifier(),
            owner: owner.clone(),
            sublayers: owned.iter().map(|c| c.layer().identifier()).collect(),
        });
    }
    if owned.is_empty() {
        return tree;
    }

    let mut children = owned;
    children.extend(rest);
    LayerTree::new(tree.layer().clone(), tree.offset(), children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::layer::LayerRegistry;
    use crate::stack::LayerStack;
    use serde_json::json;

    #[test]
    fn test_owned_sublayers_sort_to_front() {
        let registry = LayerRegistry::new();
        let root = registry.create("root.layer");
        root.set_field(&ScenePath::absolute_root(), fields::HAS_OWNED_SUBLAYERS, json!(true));
        let session = registry.create("session.layer");
        session.set_field(&ScenePath::absolute_root(), fields::SESSION_OWNER, json!("anim"));

        let plain = registry.create("plain.layer");
        let owned = registry.create("owned.layer");
        owned.set_field(&ScenePath::absolute_root(), fields::OWNER, json!("anim"));
        root.push_sublayer("plain.layer", TimeOffset::identity());
        root.push_sublayer("owned.layer", TimeOffset::identity());

        let id = LayerStackIdentifier::new(root.clone(), Some(session.clone()));
        let muted = MutedLayers::default();
        let config = Config::default();
        let ctx = LayerStackContext {
            provider: &registry,
            muted: &muted,
            usd_mode: true,
            config: &config,
            cache_root: &id,
        };
        let stack = LayerStack::compute(id.clone(), &ctx);
        assert_eq!(stack.layers(), &[session, root, owned, plain]);
    }

    #[test]
    fn test_multiple_owned_siblings_reported() {
        let registry = LayerRegistry::new();
        let root = registry.create("root.layer");
        root.set_field(&ScenePath::absolute_root(), fields::HAS_OWNED_SUBLAYERS, json!(true));
        let session = registry.create("session.layer");
        session.set_field(&ScenePath::absolute_root(), fields::SESSION_OWNER, json!("anim"));
        for name in ["one.layer", "two.layer"] {
            let sub = registry.create(name);
            sub.set_field(&ScenePath::absolute_root(), fields::OWNER, json!("anim"));
            root.push_sublayer(name, TimeOffset::identity());
        }

        let id = LayerStackIdentifier::new(root.clone(), Some(session));
        let muted = MutedLayers::default();
        let config = Config::default();
        let ctx = LayerStackContext {
            provider: &registry,
            muted: &muted,
            usd_mode: true,
            config: &config,
            cache_root: &id,
        };
        let stack = LayerStack::compute(id.clone(), &ctx);
        assert!(stack
            .errors()
            .iter()
            .any(|e| matches!(e, ComposeError::InvalidSublayerOwnership { .. })));
        assert_eq!(stack.layers().len(), 4);
    }

    #[test]
    fn test_invalid_offset_degrades_to_identity() {
        let registry = LayerRegistry::new();
        let root = registry.create("root.layer");
        let sub = registry.create("sub.layer");
        root.push_sublayer("sub.layer", TimeOffset::new(5.0, 0.0));

        let id = LayerStackIdentifier::new(root, None);
        let muted = MutedLayers::default();
        let config = Config::default();
        let ctx = LayerStackContext {
            provider: &registry,
            muted: &muted,
            usd_mode: true,
            config: &config,
            cache_root: &id,
        };
        let stack = LayerStack::compute(id.clone(), &ctx);
        assert_eq!(stack.offset_for_layer(&sub), Some(TimeOffset::identity()));
        assert!(matches!(stack.errors()[0], ComposeError::InvalidSublayerOffset { .. }));
    }

    #[test]
    fn test_zero_rate_sublayer_scales_against_fallback() {
        let registry = LayerRegistry::new();
        let root = registry.create("root.layer");
        root.set_field(&ScenePath::absolute_root(), fields::TIME_CODES_PER_SECOND, json!(48.0));
        let sub = registry.create("sub.layer");
        sub.set_field(&ScenePath::absolute_root(), fields::TIME_CODES_PER_SECOND, json!(0.0));
        root.push_sublayer("sub.layer", TimeOffset::identity());

        let id = LayerStackIdentifier::new(root, None);
        let muted = MutedLayers::default();
        let config = Config::default();
        let ctx = LayerStackContext {
            provider: &registry,
            muted: &muted,
            usd_mode: true,
            config: &config,
            cache_root: &id,
        };
        let stack = LayerStack::compute(id.clone(), &ctx);
        // The authored zero rate reads as the 24.0 fallback, so the scale is
        // 48/24 rather than infinite.
        assert_eq!(stack.offset_for_layer(&sub), Some(TimeOffset::new(0.0, 2.0)));
    }
}
