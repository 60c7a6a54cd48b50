//! Layer stacks: the assembled unit of composition.
//!
//! A [`LayerStack`] owns the strength-ordered layer list with cumulative
//! time-offset map functions, the sublayer tree, the relocation tables, the
//! composed expression variables, and the muted-path set for one
//! [`LayerStackIdentifier`]. Stacks are computed on first use and kept by the
//! owning registry; change processing recomputes only the parts an edit
//! touched.

mod builder;
mod registry;

pub use registry::LayerStackRegistry;

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::MutedLayers;
use crate::config::Config;
use crate::error::ComposeError;
use crate::layer::{Layer, LayerProvider};
use crate::mapfn::MapFunction;
use crate::offset::TimeOffset;
use crate::path::ScenePath;
use crate::relocates::{RelocationTables, resolve_layer_stack_relocations};
use crate::vars::{ExpressionVariableComposer, ExpressionVariables, ExpressionVariablesSource};

// =========================================================================
// Identifier
// =========================================================================

/// The cache key for a layer stack: root layer, optional session layer, and
/// the expression-variable override source.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct LayerStackIdentifier {
    /// The root layer of the stack.
    pub root_layer: Layer,
    /// The session layer, composed stronger than the root chain.
    pub session_layer: Option<Layer>,
    /// Where this stack's expression-variable overrides come from.
    pub expression_variables_override_source: ExpressionVariablesSource,
}

impl LayerStackIdentifier {
    /// An identifier with the default (cache-root) override source.
    pub fn new(root_layer: Layer, session_layer: Option<Layer>) -> Self {
        LayerStackIdentifier {
            root_layer,
            session_layer,
            expression_variables_override_source: ExpressionVariablesSource::cache_root(),
        }
    }

    /// An identifier with an explicit override source.
    pub fn with_override_source(
        root_layer: Layer,
        session_layer: Option<Layer>,
        source: ExpressionVariablesSource,
    ) -> Self {
        LayerStackIdentifier {
            root_layer,
            session_layer,
            expression_variables_override_source: source,
        }
    }
}

// =========================================================================
// Tree
// =========================================================================

/// One node of the sublayer tree: a layer, its cumulative offset into the
/// stack's timeline, and its resolved sublayers in strength order.
#[derive(Debug)]
pub struct LayerTree {
    layer: Layer,
    offset: TimeOffset,
    children: Vec<Arc<LayerTree>>,
}

impl LayerTree {
    /// Creates a tree node.
    pub fn new(layer: Layer, offset: TimeOffset, children: Vec<Arc<LayerTree>>) -> Arc<Self> {
        Arc::new(LayerTree { layer, offset, children })
    }

    /// The layer at this node.
    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// The cumulative offset mapping this layer's times into the stack root's
    /// timeline.
    pub fn offset(&self) -> TimeOffset {
        self.offset
    }

    /// Resolved sublayers, strongest first.
    pub fn children(&self) -> &[Arc<LayerTree>] {
        &self.children
    }

    /// Appends this subtree's layers depth-first into the flat stack order.
    fn flatten(&self, layers: &mut Vec<Layer>, map_functions: &mut Vec<MapFunction>) {
        layers.push(self.layer.clone());
        map_functions.push(MapFunction::identity_with_offset(self.offset));
        for child in &self.children {
            child.flatten(layers, map_functions);
        }
    }
}

// =========================================================================
// Context
// =========================================================================

/// Everything a stack computation needs from its owning cache, passed
/// explicitly instead of held as a back-reference.
#[derive(Clone, Copy)]
pub struct LayerStackContext<'a> {
    /// Finds or opens layers by resolved path.
    pub provider: &'a dyn LayerProvider,
    /// Muted layer paths, canonical form.
    pub muted: &'a MutedLayers,
    /// True for caches that never compose property indexes or legacy
    /// relocations and whose layers open without thread-unsafe side effects.
    pub usd_mode: bool,
    /// Feature toggles.
    pub config: &'a Config,
    /// The owning cache's root identifier, for resolving override sources.
    pub cache_root: &'a LayerStackIdentifier,
}

/// Restricts a provider to layers that are already open.
struct FindOnly<'a> {
    inner: &'a dyn LayerProvider,
}

impl LayerProvider for FindOnly<'_> {
    fn find(&self, identifier: &str) -> Option<Layer> {
        self.inner.find(identifier)
    }
}

/// Where an opened sublayer came from: the authoring layer, the authored
/// path, and the path actually computed for it. Recorded so resolver changes
/// can ask whether recomputation would open different layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SublayerSourceInfo {
    /// The layer whose sublayer list names the path.
    pub layer: Layer,
    /// The authored (possibly relative, possibly expression) path.
    pub authored_path: String,
    /// The resolved path the sublayer was opened from.
    pub computed_path: String,
}

// =========================================================================
// LayerStack
// =========================================================================

/// The composed state for one layer-stack identifier.
#[derive(Debug)]
pub struct LayerStack {
    identifier: LayerStackIdentifier,
    layers: Vec<Layer>,
    map_functions: Vec<MapFunction>,
    layer_tree: Option<Arc<LayerTree>>,
    session_layer_tree: Option<Arc<LayerTree>>,
    relocations: RelocationTables,
    relocates_variables: Mutex<FxHashMap<ScenePath, Arc<MapFunction>>>,
    expression_variables: Arc<ExpressionVariables>,
    used_expression_variables: BTreeSet<String>,
    muted_layers: BTreeSet<String>,
    sublayer_source_info: Vec<SublayerSourceInfo>,
    time_codes_per_second: f64,
    local_errors: Vec<ComposeError>,
}

impl LayerStack {
    /// Computes the full stack for `identifier`.
    pub fn compute(identifier: LayerStackIdentifier, ctx: &LayerStackContext<'_>) -> LayerStack {
        let mut stack = LayerStack {
            identifier,
            layers: Vec::new(),
            map_functions: Vec::new(),
            layer_tree: None,
            session_layer_tree: None,
            relocations: RelocationTables::default(),
            relocates_variables: Mutex::new(FxHashMap::default()),
            expression_variables: Arc::new(ExpressionVariables::default()),
            used_expression_variables: BTreeSet::new(),
            muted_layers: BTreeSet::new(),
            sublayer_source_info: Vec::new(),
            time_codes_per_second: crate::offset::FALLBACK_TIME_CODES_PER_SECOND,
            local_errors: Vec::new(),
        };
        stack.recompute_layers(ctx);
        stack
    }

    /// Rebuilds the layer list, tree, offsets, expression variables, and
    /// relocations from scratch.
    pub fn recompute_layers(&mut self, ctx: &LayerStackContext<'_>) {
        let mut composer = ExpressionVariableComposer::new();
        let vars = composer.compute(&self.identifier, ctx.cache_root);
        self.recompute_layers_with_vars(ctx, vars);
    }

    /// Rebuilds the layer tree, offsets, and relocations without opening any
    /// document: an offsets-only edit keeps the layer set, so every layer is
    /// already open and findable.
    pub(crate) fn recompute_layer_offsets(&mut self, ctx: &LayerStackContext<'_>) {
        let provider = FindOnly { inner: ctx.provider };
        let ctx = LayerStackContext { provider: &provider, ..*ctx };
        let vars = Arc::clone(&self.expression_variables);
        self.recompute_layers_with_vars(&ctx, vars);
    }

    pub(crate) fn recompute_layers_with_vars(
        &mut self,
        ctx: &LayerStackContext<'_>,
        vars: Arc<ExpressionVariables>,
    ) {
        self.expression_variables = vars;
        self.local_errors.clear();

        let built = builder::build(&self.identifier, &self.expression_variables, ctx);
        self.layers = built.layers;
        self.map_functions = built.map_functions;
        self.layer_tree = built.layer_tree;
        self.session_layer_tree = built.session_layer_tree;
        self.muted_layers = built.muted_layers;
        self.sublayer_source_info = built.sublayer_source_info;
        self.used_expression_variables = built.used_expression_variables;
        self.time_codes_per_second = built.time_codes_per_second;
        self.local_errors.extend(built.errors);

        self.recompute_relocations(ctx);
    }

    /// Recomputes the relocation tables from the current layer list and
    /// refreshes every demand-created per-path map function in place.
    pub fn recompute_relocations(&mut self, ctx: &LayerStackContext<'_>) {
        let mut errors = Vec::new();
        self.relocations = resolve_layer_stack_relocations(
            &self.layers,
            ctx.usd_mode,
            ctx.config.legacy_relocates,
            &mut errors,
        );
        self.local_errors.extend(errors);

        let mut variables = self.relocates_variables.lock();
        for (path, slot) in variables.iter_mut() {
            *slot = Arc::new(MapFunction::new(
                self.relocations.filter_for_path(path),
                TimeOffset::identity(),
            ));
        }
    }

    /// Replaces the composed expression variables without rebuilding layers.
    pub fn set_expression_variables(&mut self, vars: Arc<ExpressionVariables>) {
        self.expression_variables = vars;
    }

    // --- accessors ---

    /// The identifier this stack was computed for.
    pub fn identifier(&self) -> &LayerStackIdentifier {
        &self.identifier
    }

    /// The layers in strength order, strongest first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Cumulative time-offset map functions, parallel to
    /// [`LayerStack::layers`].
    pub fn map_functions(&self) -> &[MapFunction] {
        &self.map_functions
    }

    /// The cumulative offset for `layer`, if it is in the stack.
    pub fn offset_for_layer(&self, layer: &Layer) -> Option<TimeOffset> {
        self.layers
            .iter()
            .position(|l| l == layer)
            .map(|i| self.map_functions[i].time_offset())
    }

    /// True if `layer` is part of this stack.
    pub fn has_layer(&self, layer: &Layer) -> bool {
        self.layers.contains(layer)
    }

    /// The sublayer tree rooted at the root layer.
    pub fn layer_tree(&self) -> Option<&Arc<LayerTree>> {
        self.layer_tree.as_ref()
    }

    /// The sublayer tree rooted at the session layer, if one is composed.
    pub fn session_layer_tree(&self) -> Option<&Arc<LayerTree>> {
        self.session_layer_tree.as_ref()
    }

    /// The derived relocation tables.
    pub fn relocations(&self) -> &RelocationTables {
        &self.relocations
    }

    /// The demand-created map function for relocations whose targets lie
    /// under `path`. Cached per path; refreshed when relocations change.
    pub fn relocations_for_path(&self, path: &ScenePath) -> Arc<MapFunction> {
        let mut variables = self.relocates_variables.lock();
        Arc::clone(variables.entry(path.clone()).or_insert_with(|| {
            Arc::new(MapFunction::new(
                self.relocations.filter_for_path(path),
                TimeOffset::identity(),
            ))
        }))
    }

    /// The composed expression variables.
    pub fn expression_variables(&self) -> &Arc<ExpressionVariables> {
        &self.expression_variables
    }

    /// Variable names consumed by sublayer path expressions in this stack.
    pub fn used_expression_variables(&self) -> &BTreeSet<String> {
        &self.used_expression_variables
    }

    /// Canonical paths of layers muted out of this stack.
    pub fn muted_layers(&self) -> &BTreeSet<String> {
        &self.muted_layers
    }

    /// Provenance of every opened sublayer.
    pub fn sublayer_source_info(&self) -> &[SublayerSourceInfo] {
        &self.sublayer_source_info
    }

    /// The stack's effective time-codes-per-second rate.
    pub fn time_codes_per_second(&self) -> f64 {
        self.time_codes_per_second
    }

    /// Errors recorded during the most recent computation, sorted.
    pub fn errors(&self) -> &[ComposeError] {
        &self.local_errors
    }
}

/// The effective rate for a stack: authored session TCPS, authored root TCPS,
/// authored session FPS, authored root FPS, schema fallback — in that order.
pub fn effective_time_codes_per_second(identifier: &LayerStackIdentifier) -> f64 {
    let root = &identifier.root_layer;
    let session = identifier.session_layer.as_ref();
    if let Some(session) = session {
        if session.has_time_codes_per_second() {
            return session.time_codes_per_second();
        }
    }
    if root.has_time_codes_per_second() {
        return root.time_codes_per_second();
    }
    if let Some(session) = session {
        if session.has_frames_per_second() {
            return session.frames_per_second();
        }
    }
    if root.has_frames_per_second() {
        return root.frames_per_second();
    }
    crate::offset::FALLBACK_TIME_CODES_PER_SECOND
}
