//! The layer collaborator: a field-addressed, in-memory document store.
//!
//! Composition treats a layer as an opaque store keyed by (path, field) with
//! an ordered sublayer list and a set of spec paths. Handles are cheap clones
//! sharing one interior-locked document; identity (equality, hashing) is the
//! shared allocation, not the contents, so a layer stays "the same layer"
//! across edits and renames.

mod change_list;

pub use change_list::{ChangeEntry, ChangeFlags, ChangeList, InfoChange, SublayerChange};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::offset::{FALLBACK_TIME_CODES_PER_SECOND, TimeOffset};
use crate::path::ScenePath;

// =========================================================================
// Field names
// =========================================================================

/// Well-known field names consumed by composition.
pub mod fields {
    /// Root-level default prim name.
    pub const DEFAULT_PRIM: &str = "defaultPrim";
    /// Root-level authored time-codes-per-second rate.
    pub const TIME_CODES_PER_SECOND: &str = "timeCodesPerSecond";
    /// Root-level authored frames-per-second rate (weaker TCPS fallback).
    pub const FRAMES_PER_SECOND: &str = "framesPerSecond";
    /// Root-level expression-variable dictionary.
    pub const EXPRESSION_VARIABLES: &str = "expressionVariables";
    /// Root-level relocation list (modern form).
    pub const LAYER_RELOCATES: &str = "layerRelocates";
    /// Per-prim relocation list (legacy form).
    pub const RELOCATES: &str = "relocates";
    /// Root-level flag: this layer's direct sublayers carry owners.
    pub const HAS_OWNED_SUBLAYERS: &str = "hasOwnedSubLayers";
    /// Root-level owner name of this layer.
    pub const OWNER: &str = "owner";
    /// Root-level session owner name (read from the session layer).
    pub const SESSION_OWNER: &str = "sessionOwner";
    /// Per-prim payload list.
    pub const PAYLOAD: &str = "payload";
    /// Per-prim permission token.
    pub const PERMISSION: &str = "permission";
    /// Per-prim variant selection map.
    pub const VARIANT_SELECTION: &str = "variantSelection";
    /// Per-prim instanceable flag.
    pub const INSTANCEABLE: &str = "instanceable";
    /// Attribute default value.
    pub const DEFAULT: &str = "default";
}

// =========================================================================
// Layer
// =========================================================================

#[derive(Debug, Default)]
struct LayerData {
    identifier: String,
    fields: FxHashMap<(ScenePath, String), Value>,
    specs: BTreeSet<ScenePath>,
    sublayer_paths: Vec<String>,
    sublayer_offsets: Vec<TimeOffset>,
}

/// A shared handle to one mutable document.
#[derive(Clone)]
pub struct Layer {
    inner: Arc<RwLock<LayerData>>,
}

impl Layer {
    /// Creates an empty layer with the given identifier.
    pub fn new(identifier: impl Into<String>) -> Layer {
        Layer {
            inner: Arc::new(RwLock::new(LayerData {
                identifier: identifier.into(),
                ..LayerData::default()
            })),
        }
    }

    /// The layer's resolved identifier.
    pub fn identifier(&self) -> String {
        self.inner.read().identifier.clone()
    }

    /// Changes the layer's identifier. The handle itself is unaffected.
    pub fn set_identifier(&self, identifier: impl Into<String>) {
        self.inner.write().identifier = identifier.into();
    }

    /// True when the layer authors nothing at all.
    pub fn is_empty(&self) -> bool {
        let data = self.inner.read();
        data.fields.is_empty() && data.specs.is_empty() && data.sublayer_paths.is_empty()
    }

    // --- fields ---

    /// True if `field` is authored at `path`.
    pub fn has_field(&self, path: &ScenePath, field: &str) -> bool {
        self.inner
            .read()
            .fields
            .contains_key(&(path.clone(), field.to_owned()))
    }

    /// The authored value of `field` at `path`, if any.
    pub fn field(&self, path: &ScenePath, field: &str) -> Option<Value> {
        self.inner
            .read()
            .fields
            .get(&(path.clone(), field.to_owned()))
            .cloned()
    }

    /// Authors `value` for `field` at `path`.
    pub fn set_field(&self, path: &ScenePath, field: &str, value: Value) {
        self.inner
            .write()
            .fields
            .insert((path.clone(), field.to_owned()), value);
    }

    /// Removes `field` at `path`, returning the previous value.
    pub fn clear_field(&self, path: &ScenePath, field: &str) -> Option<Value> {
        self.inner
            .write()
            .fields
            .remove(&(path.clone(), field.to_owned()))
    }

    /// All fields authored on the root path, sorted by field name.
    pub fn root_fields(&self) -> Vec<(ScenePath, String, Value)> {
        let data = self.inner.read();
        let mut out: Vec<(ScenePath, String, Value)> = data
            .fields
            .iter()
            .filter(|((p, _), _)| p.is_absolute_root())
            .map(|((p, f), v)| (p.clone(), f.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }

    // --- specs ---

    /// Creates a prim spec at `path`, along with any missing ancestors.
    pub fn create_prim_spec(&self, path: &ScenePath) {
        let mut data = self.inner.write();
        for ancestor in path.ancestors() {
            if ancestor.is_absolute_root() {
                break;
            }
            data.specs.insert(ancestor);
        }
    }

    /// Removes the spec at `path` and every descendant spec.
    pub fn remove_prim_spec(&self, path: &ScenePath) {
        let mut data = self.inner.write();
        data.specs.retain(|p| !p.has_prefix(path));
        data.fields.retain(|(p, _), _| !p.has_prefix(path));
    }

    /// True if a spec exists at `path`.
    pub fn has_spec(&self, path: &ScenePath) -> bool {
        self.inner.read().specs.contains(path)
    }

    /// Every prim spec path, in namespace order.
    pub fn prim_spec_paths(&self) -> Vec<ScenePath> {
        self.inner.read().specs.iter().cloned().collect()
    }

    /// The prim spec paths directly under the root.
    pub fn root_prim_spec_paths(&self) -> Vec<ScenePath> {
        self.inner
            .read()
            .specs
            .iter()
            .filter(|p| p.parent().is_some_and(|parent| parent.is_absolute_root()))
            .cloned()
            .collect()
    }

    // --- sublayers ---

    /// The ordered authored sublayer paths.
    pub fn sublayer_paths(&self) -> Vec<String> {
        self.inner.read().sublayer_paths.clone()
    }

    /// The authored offsets parallel to [`Layer::sublayer_paths`].
    pub fn sublayer_offsets(&self) -> Vec<TimeOffset> {
        self.inner.read().sublayer_offsets.clone()
    }

    /// Appends a sublayer path with its authored offset.
    pub fn push_sublayer(&self, path: impl Into<String>, offset: TimeOffset) {
        let mut data = self.inner.write();
        data.sublayer_paths.push(path.into());
        data.sublayer_offsets.push(offset);
    }

    /// Inserts a sublayer path at `index`.
    pub fn insert_sublayer(&self, index: usize, path: impl Into<String>, offset: TimeOffset) {
        let mut data = self.inner.write();
        data.sublayer_paths.insert(index, path.into());
        data.sublayer_offsets.insert(index, offset);
    }

    /// Removes the first occurrence of `path` from the sublayer list.
    pub fn remove_sublayer(&self, path: &str) -> bool {
        let mut data = self.inner.write();
        match data.sublayer_paths.iter().position(|p| p == path) {
            Some(i) => {
                data.sublayer_paths.remove(i);
                data.sublayer_offsets.remove(i);
                true
            }
            None => false,
        }
    }

    /// Replaces the authored offset for the sublayer at `index`.
    pub fn set_sublayer_offset(&self, index: usize, offset: TimeOffset) {
        self.inner.write().sublayer_offsets[index] = offset;
    }

    // --- timing ---

    /// True if a TCPS rate is authored.
    pub fn has_time_codes_per_second(&self) -> bool {
        self.has_field(&ScenePath::absolute_root(), fields::TIME_CODES_PER_SECOND)
    }

    /// True if an FPS rate is authored.
    pub fn has_frames_per_second(&self) -> bool {
        self.has_field(&ScenePath::absolute_root(), fields::FRAMES_PER_SECOND)
    }

    /// The effective time-codes-per-second rate: authored TCPS, else authored
    /// FPS, else the schema fallback.
    pub fn time_codes_per_second(&self) -> f64 {
        let root = ScenePath::absolute_root();
        self.field(&root, fields::TIME_CODES_PER_SECOND)
            .or_else(|| self.field(&root, fields::FRAMES_PER_SECOND))
            .and_then(|v| v.as_f64())
            .unwrap_or(FALLBACK_TIME_CODES_PER_SECOND)
    }

    /// The authored FPS rate, else the schema fallback.
    pub fn frames_per_second(&self) -> f64 {
        self.field(&ScenePath::absolute_root(), fields::FRAMES_PER_SECOND)
            .and_then(|v| v.as_f64())
            .unwrap_or(FALLBACK_TIME_CODES_PER_SECOND)
    }

    // --- composition metadata ---

    /// The root-level default prim name, if authored.
    pub fn default_prim(&self) -> Option<String> {
        self.field(&ScenePath::absolute_root(), fields::DEFAULT_PRIM)
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    /// The root-level expression-variable dictionary, if authored.
    pub fn expression_variables(&self) -> Option<serde_json::Map<String, Value>> {
        match self.field(&ScenePath::absolute_root(), fields::EXPRESSION_VARIABLES) {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// The modern layer-level relocation list, if authored.
    pub fn layer_relocates(&self) -> Option<Vec<(ScenePath, ScenePath)>> {
        self.field(&ScenePath::absolute_root(), fields::LAYER_RELOCATES)
            .map(|v| parse_relocates(&v))
    }

    /// Authors the layer-level relocation list.
    pub fn set_layer_relocates(&self, pairs: &[(ScenePath, ScenePath)]) {
        self.set_field(
            &ScenePath::absolute_root(),
            fields::LAYER_RELOCATES,
            relocates_value(pairs),
        );
    }

    /// The legacy per-prim relocation list at `path`, if authored.
    pub fn relocates_at(&self, path: &ScenePath) -> Option<Vec<(ScenePath, ScenePath)>> {
        self.field(path, fields::RELOCATES).map(|v| parse_relocates(&v))
    }

    /// Authors a legacy per-prim relocation list at `path`.
    pub fn set_relocates_at(&self, path: &ScenePath, pairs: &[(ScenePath, ScenePath)]) {
        self.set_field(path, fields::RELOCATES, relocates_value(pairs));
    }

    /// True if the layer authors relocations anywhere, in either form.
    pub fn has_any_relocates(&self) -> bool {
        let data = self.inner.read();
        data.fields.keys().any(|(_, field)| {
            field == fields::LAYER_RELOCATES || field == fields::RELOCATES
        })
    }
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Layer {}

impl std::hash::Hash for Layer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Layer(@{}@)", self.inner.read().identifier)
    }
}

// =========================================================================
// Relocation field encoding
// =========================================================================

/// Encodes relocation pairs as a field value: `[[source, target], ...]`.
pub fn relocates_value(pairs: &[(ScenePath, ScenePath)]) -> Value {
    Value::Array(
        pairs
            .iter()
            .map(|(s, t)| Value::Array(vec![
                Value::String(s.text().to_owned()),
                Value::String(t.text().to_owned()),
            ]))
            .collect(),
    )
}

/// Decodes a relocation field value; malformed entries are skipped.
pub fn parse_relocates(value: &Value) -> Vec<(ScenePath, ScenePath)> {
    let Value::Array(entries) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let pair = entry.as_array()?;
            let source = pair.first()?.as_str()?;
            let target = pair.get(1)?.as_str()?;
            Some((ScenePath::new(source), ScenePath::new(target)))
        })
        .collect()
}

// =========================================================================
// Providers
// =========================================================================

/// Finds or opens layers by resolved identifier.
pub trait LayerProvider: Send + Sync {
    /// The already-open layer with this identifier, if any.
    fn find(&self, identifier: &str) -> Option<Layer>;

    /// Finds or opens the layer with this identifier. The in-memory default
    /// only finds; a provider backed by real storage may open here.
    fn find_or_open(&self, identifier: &str) -> Option<Layer> {
        self.find(identifier)
    }
}

/// An in-memory layer store keyed by identifier.
#[derive(Default)]
pub struct LayerRegistry {
    layers: RwLock<FxHashMap<String, Layer>>,
}

impl LayerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        LayerRegistry::default()
    }

    /// Creates and registers an empty layer.
    pub fn create(&self, identifier: impl Into<String>) -> Layer {
        let identifier = identifier.into();
        let layer = Layer::new(identifier.clone());
        self.layers.write().insert(identifier, layer.clone());
        layer
    }

    /// Registers an existing layer under its current identifier.
    pub fn add(&self, layer: &Layer) {
        self.layers.write().insert(layer.identifier(), layer.clone());
    }

    /// Unregisters the layer with this identifier.
    pub fn remove(&self, identifier: &str) -> Option<Layer> {
        self.layers.write().remove(identifier)
    }
}

impl LayerProvider for LayerRegistry {
    fn find(&self, identifier: &str) -> Option<Layer> {
        self.layers.read().get(identifier).cloned()
    }
}

/// Resolves an authored asset path against the identifier of the layer that
/// authored it. Absolute paths pass through; relative paths are joined to the
/// anchor's directory, with `./` and `../` segments collapsed.
pub fn resolve_asset_path(anchor_identifier: &str, authored: &str) -> String {
    if authored.starts_with('/') {
        return authored.to_owned();
    }
    let mut segments: Vec<&str> = match anchor_identifier.rfind('/') {
        Some(i) => anchor_identifier[..i].split('/').collect(),
        None => Vec::new(),
    };
    for segment in authored.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}
