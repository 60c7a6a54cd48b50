//! The dependency-index collaborator.
//!
//! Composition does not know which cached results consume a given site; the
//! owning system does. [`DependencyIndex`] is the seam the change processor
//! queries for fan-out and hands the final invalidation sets back through.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::changes::CacheChanges;
use crate::mapfn::MapFunction;
use crate::path::ScenePath;
use crate::stack::LayerStackIdentifier;

// =========================================================================
// Dependency types
// =========================================================================

/// Bitmask of dependency kinds to query for.
pub type DependencyTypeMask = u32;

/// Mask bits for [`DependencyIndex::find_site_dependencies`].
pub mod dependency_type {
    use super::DependencyTypeMask;

    /// The site is the dependent's own root.
    pub const ROOT: DependencyTypeMask = 1 << 0;
    /// The dependent points at the site directly through an arc.
    pub const DIRECT: DependencyTypeMask = 1 << 1;
    /// The dependent inherits the site from an ancestor's arc.
    pub const ANCESTRAL: DependencyTypeMask = 1 << 2;
    /// The arc exists only for namespace bookkeeping.
    pub const VIRTUAL: DependencyTypeMask = 1 << 3;

    /// Every kind backed by a real arc.
    pub const ANY_NON_VIRTUAL: DependencyTypeMask = ROOT | DIRECT | ANCESTRAL;
    /// Every kind.
    pub const ANY: DependencyTypeMask = ANY_NON_VIRTUAL | VIRTUAL;
}

/// One dependent of a site: the cached result's path, the site path it
/// depends on, and the namespace mapping between them.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    /// Path of the cached composition result.
    pub index_path: ScenePath,
    /// The depended-on site path, in the site's namespace.
    pub site_path: ScenePath,
    /// Maps site paths into the dependent's namespace.
    pub map_function: MapFunction,
}

// =========================================================================
// The collaborator trait
// =========================================================================

/// The owning system's view of which cached results depend on which sites.
///
/// Everything beyond [`DependencyIndex::find_site_dependencies`] has a
/// conservative default so minimal hosts implement one method.
pub trait DependencyIndex: Send + Sync {
    /// All cached results depending on `site_path` within `layer_stack`.
    ///
    /// `recurse_on_site` extends the query to namespace descendants of the
    /// site (needed for significant changes, so descendants relocated out of
    /// the subtree are still caught); `recurse_on_index` extends it to
    /// descendants of each dependent result; `filter_existing_only` drops
    /// dependents with no currently-built result.
    fn find_site_dependencies(
        &self,
        layer_stack: &LayerStackIdentifier,
        site_path: &ScenePath,
        mask: DependencyTypeMask,
        recurse_on_site: bool,
        recurse_on_index: bool,
        filter_existing_only: bool,
    ) -> Vec<Dependency>;

    /// True if a composition result exists at `path`.
    fn has_prim_index(&self, _path: &ScenePath) -> bool {
        false
    }

    /// The number of specs contributing to the result at `path`, counted
    /// after the edit being classified.
    fn prim_index_spec_count(&self, _path: &ScenePath) -> usize {
        0
    }

    /// Results whose composition read expression variables of `layer_stack`.
    fn prims_using_expression_variables(
        &self,
        _layer_stack: &LayerStackIdentifier,
    ) -> Vec<ScenePath> {
        Vec::new()
    }

    /// True if the result at `path` read the named variable.
    fn prim_uses_expression_variable(&self, _path: &ScenePath, _name: &str) -> bool {
        false
    }

    /// True if any result depends on dynamic file-format argument fields.
    fn has_dynamic_format_field_dependencies(&self) -> bool {
        false
    }

    /// True if any result depends on attribute defaults as format arguments.
    fn has_dynamic_format_attribute_dependencies(&self) -> bool {
        false
    }

    /// True if `field` could feed any result's file-format arguments.
    fn is_possible_dynamic_format_field(&self, _field: &str) -> bool {
        false
    }

    /// True if defaults of attributes named `name` could feed any result's
    /// file-format arguments.
    fn is_possible_dynamic_format_attribute(&self, _name: &str) -> bool {
        false
    }

    /// Whether this specific field change alters the arguments the result at
    /// `index_path` was built with. Only a positive answer promotes the
    /// change to significant.
    fn can_field_change_affect_format_arguments(
        &self,
        _index_path: &ScenePath,
        _field: &str,
        _old: Option<&Value>,
        _new: Option<&Value>,
    ) -> bool {
        false
    }

    /// Whether a default-value change on `attribute_path` alters the
    /// arguments the result at `index_path` was built with.
    fn can_attribute_default_change_affect_format_arguments(
        &self,
        _index_path: &ScenePath,
        _attribute_path: &ScenePath,
    ) -> bool {
        false
    }

    /// Receives the committed invalidation sets during apply. The host blows
    /// its cached results here.
    fn commit(&self, _changes: &CacheChanges) {}
}

/// A dependency index with no dependents; useful for stack-only hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependencies;

impl DependencyIndex for NoDependencies {
    fn find_site_dependencies(
        &self,
        _layer_stack: &LayerStackIdentifier,
        _site_path: &ScenePath,
        _mask: DependencyTypeMask,
        _recurse_on_site: bool,
        _recurse_on_index: bool,
        _filter_existing_only: bool,
    ) -> Vec<Dependency> {
        Vec::new()
    }
}

// =========================================================================
// Dynamic file-format dependency bookkeeping
// =========================================================================

/// A side table hosts can use to answer the dynamic-format queries: which
/// field and attribute names can feed format arguments, and which results
/// registered interest in them.
#[derive(Debug, Default)]
pub struct DynamicFormatDependencies {
    possible_fields: FxHashSet<String>,
    possible_attributes: FxHashSet<String>,
    fields_by_index: FxHashMap<ScenePath, FxHashSet<String>>,
    attributes_by_index: FxHashMap<ScenePath, FxHashSet<String>>,
}

impl DynamicFormatDependencies {
    /// Creates an empty table.
    pub fn new() -> Self {
        DynamicFormatDependencies::default()
    }

    /// Registers that the result at `index_path` derives format arguments
    /// from `field`.
    pub fn add_field_dependency(&mut self, index_path: ScenePath, field: impl Into<String>) {
        let field = field.into();
        self.possible_fields.insert(field.clone());
        self.fields_by_index.entry(index_path).or_default().insert(field);
    }

    /// Registers that the result at `index_path` derives format arguments
    /// from defaults of attributes named `name`.
    pub fn add_attribute_dependency(&mut self, index_path: ScenePath, name: impl Into<String>) {
        let name = name.into();
        self.possible_attributes.insert(name.clone());
        self.attributes_by_index.entry(index_path).or_default().insert(name);
    }

    /// Drops everything registered for `index_path`.
    pub fn remove_index(&mut self, index_path: &ScenePath) {
        self.fields_by_index.remove(index_path);
        self.attributes_by_index.remove(index_path);
        self.possible_fields = self.fields_by_index.values().flatten().cloned().collect();
        self.possible_attributes = self.attributes_by_index.values().flatten().cloned().collect();
    }

    /// True if any result registered a field dependency.
    pub fn has_field_dependencies(&self) -> bool {
        !self.fields_by_index.is_empty()
    }

    /// True if any result registered an attribute dependency.
    pub fn has_attribute_dependencies(&self) -> bool {
        !self.attributes_by_index.is_empty()
    }

    /// True if `field` is registered by any result.
    pub fn is_possible_field(&self, field: &str) -> bool {
        self.possible_fields.contains(field)
    }

    /// True if `name` is registered by any result.
    pub fn is_possible_attribute(&self, name: &str) -> bool {
        self.possible_attributes.contains(name)
    }

    /// True if the result at `index_path` registered `field`.
    pub fn index_depends_on_field(&self, index_path: &ScenePath, field: &str) -> bool {
        self.fields_by_index
            .get(index_path)
            .is_some_and(|fields| fields.contains(field))
    }

    /// True if the result at `index_path` registered attribute `name`.
    pub fn index_depends_on_attribute(&self, index_path: &ScenePath, name: &str) -> bool {
        self.attributes_by_index
            .get(index_path)
            .is_some_and(|names| names.contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_format_table() {
        let mut table = DynamicFormatDependencies::new();
        let prim = ScenePath::new("/Rig");
        table.add_field_dependency(prim.clone(), "resolution");
        assert!(table.is_possible_field("resolution"));
        assert!(table.index_depends_on_field(&prim, "resolution"));
        assert!(!table.index_depends_on_field(&prim, "other"));
        table.remove_index(&prim);
        assert!(!table.is_possible_field("resolution"));
    }
}
