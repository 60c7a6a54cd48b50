//! Per-layer edit batches.
//!
//! A [`ChangeList`] is the ordered record of edits made to one layer during a
//! change block: per-path flags, info-field changes with old and new values,
//! sublayer-list changes, and rename old-paths. The change processor consumes
//! these; it never inspects layer contents to rediscover what happened.

use serde_json::Value;

use crate::layer::Layer;
use crate::path::ScenePath;

// =========================================================================
// Entry flags
// =========================================================================

/// What happened at one path, as boolean flags.
///
/// "Inert" spec changes are structural-only edits (an empty over holding
/// namespace); "non-inert" changes carry opinions and always matter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ChangeFlags {
    pub did_replace_content: bool,
    pub did_change_identifier: bool,
    pub did_rename: bool,
    pub did_add_inert_prim: bool,
    pub did_remove_inert_prim: bool,
    pub did_add_non_inert_prim: bool,
    pub did_remove_non_inert_prim: bool,
    pub did_add_property: bool,
    pub did_remove_property: bool,
    pub did_add_property_with_only_required_fields: bool,
    pub did_remove_property_with_only_required_fields: bool,
    pub did_change_relationship_targets: bool,
    pub did_change_attribute_connection: bool,
    pub did_add_target: bool,
    pub did_remove_target: bool,
    pub did_change_resolved_path: bool,
    pub did_change_prim_inherit_paths: bool,
    pub did_change_prim_specializes: bool,
    pub did_change_prim_references: bool,
    pub did_change_prim_variant_sets: bool,
}

/// One info-field change with its old and new values (`None` = absent).
#[derive(Debug, Clone, PartialEq)]
pub struct InfoChange {
    /// The field name.
    pub field: String,
    /// Value before the edit.
    pub old: Option<Value>,
    /// Value after the edit.
    pub new: Option<Value>,
}

/// How a sublayer list entry changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SublayerChange {
    /// The sublayer path was added to the list.
    Added,
    /// The sublayer path was removed from the list.
    Removed,
    /// Only the authored offset for the sublayer changed.
    Offset,
}

/// All edits recorded at one path.
#[derive(Debug, Clone, Default)]
pub struct ChangeEntry {
    /// Boolean edit flags.
    pub flags: ChangeFlags,
    /// Info-field changes, in edit order.
    pub info_changed: Vec<InfoChange>,
    /// Sublayer-list changes (authored path, kind). Only meaningful on the
    /// root entry.
    pub sublayer_changes: Vec<(String, SublayerChange)>,
    /// For renames, the path this spec previously lived at.
    pub old_path: Option<ScenePath>,
}

// =========================================================================
// ChangeList
// =========================================================================

/// The ordered edit batch for one layer.
#[derive(Debug, Clone, Default)]
pub struct ChangeList {
    entries: Vec<(ScenePath, ChangeEntry)>,
}

impl ChangeList {
    /// An empty change list.
    pub fn new() -> Self {
        ChangeList::default()
    }

    /// The recorded entries, in edit order.
    pub fn entries(&self) -> &[(ScenePath, ChangeEntry)] {
        &self.entries
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry for `path`, appending a fresh one if none exists yet.
    pub fn entry_mut(&mut self, path: &ScenePath) -> &mut ChangeEntry {
        if let Some(i) = self.entries.iter().position(|(p, _)| p == path) {
            return &mut self.entries[i].1;
        }
        self.entries.push((path.clone(), ChangeEntry::default()));
        let last = self.entries.len() - 1;
        &mut self.entries[last].1
    }

    /// Records an info-field change at `path`.
    pub fn record_info_change(
        &mut self,
        path: &ScenePath,
        field: &str,
        old: Option<Value>,
        new: Option<Value>,
    ) {
        self.entry_mut(path).info_changed.push(InfoChange {
            field: field.to_owned(),
            old,
            new,
        });
    }

    /// Records a sublayer-list change on the root entry.
    pub fn record_sublayer_change(&mut self, sublayer_path: &str, change: SublayerChange) {
        self.entry_mut(&ScenePath::absolute_root())
            .sublayer_changes
            .push((sublayer_path.to_owned(), change));
    }

    /// Synthesizes the edit batch that would result from replacing `layer`'s
    /// content with an empty document.
    ///
    /// Muting takes this batch through the ordinary classification pipeline
    /// so a muted layer invalidates exactly what its opinions touched.
    pub fn diff_to_empty(layer: &Layer) -> ChangeList {
        let mut list = ChangeList::new();
        for (path, field, value) in layer.root_fields() {
            list.record_info_change(&path, &field, Some(value), None);
        }
        for sub in layer.sublayer_paths() {
            list.record_sublayer_change(&sub, SublayerChange::Removed);
        }
        for prim in layer.root_prim_spec_paths() {
            list.entry_mut(&prim).flags.did_remove_non_inert_prim = true;
        }
        list
    }

    /// Synthesizes the edit batch that would result from replacing an empty
    /// document with `layer`'s content. Mirror of [`ChangeList::diff_to_empty`].
    pub fn diff_from_empty(layer: &Layer) -> ChangeList {
        let mut list = ChangeList::new();
        for (path, field, value) in layer.root_fields() {
            list.record_info_change(&path, &field, None, Some(value));
        }
        for sub in layer.sublayer_paths() {
            list.record_sublayer_change(&sub, SublayerChange::Added);
        }
        for prim in layer.root_prim_spec_paths() {
            list.entry_mut(&prim).flags.did_add_non_inert_prim = true;
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Layer;

    #[test]
    fn test_entry_order_preserved() {
        let mut list = ChangeList::new();
        list.entry_mut(&ScenePath::new("/B")).flags.did_add_non_inert_prim = true;
        list.entry_mut(&ScenePath::new("/A")).flags.did_add_inert_prim = true;
        list.entry_mut(&ScenePath::new("/B")).flags.did_rename = true;
        let paths: Vec<&str> = list.entries().iter().map(|(p, _)| p.text()).collect();
        assert_eq!(paths, vec!["/B", "/A"]);
        assert!(list.entries()[0].1.flags.did_add_non_inert_prim);
        assert!(list.entries()[0].1.flags.did_rename);
    }

    #[test]
    fn test_diff_to_empty() {
        let layer = Layer::new("a.layer");
        layer.create_prim_spec(&ScenePath::new("/A"));
        layer.push_sublayer("sub.layer", crate::offset::TimeOffset::identity());
        let list = ChangeList::diff_to_empty(&layer);
        let root = list
            .entries()
            .iter()
            .find(|(p, _)| p.is_absolute_root())
            .map(|(_, e)| e)
            .unwrap();
        assert_eq!(root.sublayer_changes, vec![("sub.layer".into(), SublayerChange::Removed)]);
        let prim = list
            .entries()
            .iter()
            .find(|(p, _)| p.text() == "/A")
            .map(|(_, e)| e)
            .unwrap();
        assert!(prim.flags.did_remove_non_inert_prim);
    }
}
