//! Scene paths: absolute addresses of prims, properties, and targets.
//!
//! Paths are stored as canonical text (`/Root/Child`, `/Root{set=sel}Child`,
//! `/Root/Child.attr`, `/Root/Child.rel[/Tgt]`) behind a shared allocation,
//! with component-aware prefix algebra on top. Ordering is the canonical
//! text ordering, which is stable and cheap; algorithms that need
//! namespace-aware containment use [`ScenePath::has_prefix`] rather than
//! relying on contiguous ranges.

use std::fmt;
use std::sync::Arc;

/// An absolute scene-description path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScenePath(Arc<str>);

impl ScenePath {
    /// The absolute root path `/`.
    pub fn absolute_root() -> Self {
        ScenePath(Arc::from("/"))
    }

    /// Creates a path from canonical absolute text.
    ///
    /// The text must start with `/`; no further validation is performed.
    pub fn new(text: impl AsRef<str>) -> Self {
        let text = text.as_ref();
        debug_assert!(text.starts_with('/'), "scene paths are absolute: {text}");
        ScenePath(Arc::from(text))
    }

    /// The canonical text of this path.
    pub fn text(&self) -> &str {
        &self.0
    }

    /// True if this is the absolute root path `/`.
    pub fn is_absolute_root(&self) -> bool {
        &*self.0 == "/"
    }

    /// True for prim paths without variant selections (e.g. `/A/B`).
    pub fn is_prim_path(&self) -> bool {
        !self.is_absolute_root()
            && !self.0.contains('.')
            && !self.0.contains('{')
    }

    /// True for prim paths, with or without variant selections.
    pub fn is_prim_or_variant_path(&self) -> bool {
        !self.is_absolute_root() && !self.0.contains('.')
    }

    /// True if any component carries a variant selection.
    pub fn contains_variant_selection(&self) -> bool {
        self.0.contains('{')
    }

    /// True for property paths (`/A/B.attr`), excluding target paths.
    pub fn is_property_path(&self) -> bool {
        self.0.contains('.') && !self.0.ends_with(']')
    }

    /// True for property paths whose owner is a prim (possibly with a
    /// variant selection).
    pub fn is_prim_property_path(&self) -> bool {
        self.is_property_path() && self.prim_path().is_prim_or_variant_path()
    }

    /// True for relationship-target / connection paths (`/A/B.rel[/Tgt]`).
    pub fn is_target_path(&self) -> bool {
        self.0.ends_with(']')
    }

    /// True if this is the root path or a prim path of any flavor.
    pub fn is_root_or_prim_path(&self) -> bool {
        self.is_absolute_root() || self.is_prim_or_variant_path()
    }

    /// The last component's name: prim name, property name, or the bracketed
    /// target text for target paths.
    pub fn name(&self) -> &str {
        if self.is_absolute_root() {
            return "";
        }
        let t = &*self.0;
        if let Some(i) = t.rfind('[') {
            return &t[i + 1..t.len() - 1];
        }
        if let Some(i) = t.rfind('.') {
            return &t[i + 1..];
        }
        let cut = t.rfind(['/', '}']).unwrap_or(0);
        &t[cut + 1..]
    }

    /// The prim part of a property or target path; identity for prim paths.
    pub fn prim_path(&self) -> ScenePath {
        match self.0.find('.') {
            Some(i) => ScenePath::new(&self.0[..i]),
            None => self.clone(),
        }
    }

    /// The root prim under `/` that this path descends from, if any.
    pub fn root_prim(&self) -> Option<ScenePath> {
        if self.is_absolute_root() {
            return None;
        }
        let t = &self.0[1..];
        let end = t.find(['/', '.', '{']).map_or(self.0.len(), |i| i + 1);
        Some(ScenePath::new(&self.0[..end]))
    }

    /// The parent path, or `None` for the absolute root.
    pub fn parent(&self) -> Option<ScenePath> {
        let t = &*self.0;
        if self.is_absolute_root() {
            return None;
        }
        if t.ends_with(']') {
            // Target path: parent is the owning property.
            let i = t.rfind('[').expect("target path has an opening bracket");
            return Some(ScenePath::new(&t[..i]));
        }
        if let Some(i) = t.rfind('.') {
            return Some(ScenePath::new(&t[..i]));
        }
        if t.ends_with('}') {
            // Variant selection: parent is the prim without the selection.
            let i = t.rfind('{').expect("variant selection has an opening brace");
            return Some(ScenePath::new(&t[..i]));
        }
        let cut = t.rfind(['/', '}']).expect("non-root path has a separator");
        if cut == 0 {
            return Some(ScenePath::absolute_root());
        }
        Some(ScenePath::new(&t[..cut + 1].trim_end_matches('/')))
    }

    /// Iterates this path and all its ancestors up to the absolute root.
    pub fn ancestors(&self) -> impl Iterator<Item = ScenePath> {
        std::iter::successors(Some(self.clone()), |p| p.parent())
    }

    /// Appends a prim child component.
    pub fn append_child(&self, name: &str) -> ScenePath {
        if self.is_absolute_root() {
            ScenePath::new(format!("/{name}"))
        } else if self.0.ends_with('}') {
            ScenePath::new(format!("{}{name}", self.0))
        } else {
            ScenePath::new(format!("{}/{name}", self.0))
        }
    }

    /// Appends a variant selection component `{set=sel}`.
    pub fn append_variant_selection(&self, set: &str, sel: &str) -> ScenePath {
        ScenePath::new(format!("{}{{{set}={sel}}}", self.0))
    }

    /// Appends a property component.
    pub fn append_property(&self, name: &str) -> ScenePath {
        ScenePath::new(format!("{}.{name}", self.0))
    }

    /// Appends a target component to a property path.
    pub fn append_target(&self, target: &ScenePath) -> ScenePath {
        ScenePath::new(format!("{}[{}]", self.0, target.0))
    }

    /// Component-aware prefix test: `/A` is a prefix of `/A/B` and `/A.x`
    /// but not of `/AB`. Every absolute path has the root as a prefix, and
    /// every path is a prefix of itself.
    pub fn has_prefix(&self, prefix: &ScenePath) -> bool {
        if prefix.is_absolute_root() {
            return true;
        }
        let (t, p) = (&*self.0, &*prefix.0);
        if !t.starts_with(p) {
            return false;
        }
        if t.len() == p.len() {
            return true;
        }
        // A component boundary must follow the prefix; a variant-selection
        // prefix ending in '}' is a boundary by itself.
        p.ends_with('}') || matches!(t.as_bytes()[p.len()], b'/' | b'.' | b'{' | b'[')
    }

    /// Rewrites the `old` prefix to `new`; returns the path unchanged if
    /// `old` is not a prefix of it.
    pub fn replace_prefix(&self, old: &ScenePath, new: &ScenePath) -> ScenePath {
        if !self.has_prefix(old) {
            return self.clone();
        }
        if old.is_absolute_root() {
            if new.is_absolute_root() {
                return self.clone();
            }
            return ScenePath::new(format!("{}{}", new.0, self.0));
        }
        let rest = &self.0[old.0.len()..];
        if rest.is_empty() {
            return new.clone();
        }
        if new.is_absolute_root() {
            return ScenePath::new(rest);
        }
        ScenePath::new(format!("{}{rest}", new.0))
    }
}

impl fmt::Display for ScenePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ScenePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl From<&str> for ScenePath {
    fn from(text: &str) -> Self {
        ScenePath::new(text)
    }
}

/// Removes every path in `set` that has a strict ancestor also in `set`.
///
/// Used when a significant change to `/A` makes separate bookkeeping for
/// `/A/B` redundant.
pub fn retain_roots(set: &mut std::collections::BTreeSet<ScenePath>) {
    let snapshot: Vec<ScenePath> = set.iter().cloned().collect();
    for path in snapshot {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if set.contains(&p) {
                set.remove(&path);
                break;
            }
            parent = p.parent();
        }
    }
}

/// Removes every path in `set` that is a strict or exact descendant of
/// `prefix`.
pub fn remove_descendants(
    set: &mut std::collections::BTreeSet<ScenePath>,
    prefix: &ScenePath,
) {
    set.retain(|p| !p.has_prefix(prefix));
}
