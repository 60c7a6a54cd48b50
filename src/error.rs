//! Composition errors.
//!
//! Every fallible step of composition appends structured errors to a
//! caller-supplied vector and keeps going; a bad relocation or an unreadable
//! sublayer degrades that entry, never the whole result. Errors carry layer
//! identifiers (not handles) so they stay cheap, comparable, and printable
//! after the layers involved are gone.

use thiserror::Error;

use crate::offset::TimeOffset;
use crate::path::ScenePath;

/// Why a structurally valid relocation was rejected during cross-validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationConflict {
    /// The target is itself the source of another relocation.
    TargetIsAnotherSource,
    /// An ancestor of the source is the source of another relocation: the
    /// subtree was already moved away.
    SourceUnderMovedSubtree,
    /// An ancestor of the target is the source of another relocation.
    TargetUnderMovedSubtree,
}

impl RelocationConflict {
    fn describe(self) -> &'static str {
        match self {
            RelocationConflict::TargetIsAnotherSource => {
                "target is the source of another relocation"
            }
            RelocationConflict::SourceUnderMovedSubtree => {
                "source lies under a subtree moved by another relocation"
            }
            RelocationConflict::TargetUnderMovedSubtree => {
                "target lies under a subtree moved by another relocation"
            }
        }
    }
}

/// Why an authored relocation is malformed on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRelocation {
    /// Source or target is not an absolute prim path.
    NotAPrimPath,
    /// Source or target carries a variant selection.
    VariantSelection,
    /// Source or target is a root prim or the absolute root.
    RootPath,
    /// Target equals the source or is an ancestor of it.
    TargetIsSelfOrAncestor,
    /// Target is a descendant of the source.
    TargetIsDescendant,
    /// Source and target live under different root prims.
    CrossesRootPrims,
}

impl InvalidRelocation {
    fn describe(self) -> &'static str {
        match self {
            InvalidRelocation::NotAPrimPath => "path is not an absolute prim path",
            InvalidRelocation::VariantSelection => "path contains a variant selection",
            InvalidRelocation::RootPath => "path is a root prim or the absolute root",
            InvalidRelocation::TargetIsSelfOrAncestor => {
                "target equals the source or is an ancestor of it"
            }
            InvalidRelocation::TargetIsDescendant => "target is a descendant of the source",
            InvalidRelocation::CrossesRootPrims => {
                "source and target live under different root prims"
            }
        }
    }
}

/// A structured composition error.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ComposeError {
    /// A sublayer asset path did not resolve to an openable layer.
    #[error("in @{layer}@: could not open sublayer @{sublayer_path}@")]
    InvalidSublayerPath {
        /// Identifier of the layer that lists the sublayer.
        layer: String,
        /// The computed sublayer asset path.
        sublayer_path: String,
    },

    /// A sublayer chain led back to a layer already on the open ancestor
    /// chain.
    #[error("in @{layer}@: sublayer @{sublayer}@ introduces a cycle")]
    SublayerCycle {
        /// Identifier of the layer that lists the sublayer.
        layer: String,
        /// Identifier of the cycling sublayer.
        sublayer: String,
    },

    /// An authored sublayer offset was non-invertible; identity was used.
    #[error("in @{layer}@: invalid offset {offset} for sublayer @{sublayer}@")]
    InvalidSublayerOffset {
        /// Identifier of the layer that authored the offset.
        layer: String,
        /// Identifier of the affected sublayer.
        sublayer: String,
        /// The rejected offset.
        offset: TimeOffset,
    },

    /// More than one sibling sublayer claims the session owner.
    #[error("in @{layer}@: multiple sublayers owned by session owner '{owner}'")]
    InvalidSublayerOwnership {
        /// Identifier of the layer with owned sublayers.
        layer: String,
        /// The session owner name.
        owner: String,
        /// Identifiers of every owned sibling.
        sublayers: Vec<String>,
    },

    /// A variable expression in a sublayer path could not be evaluated.
    #[error("in @{layer}@: expression '{expression}' failed: {message}")]
    ExpressionEvaluation {
        /// Identifier of the layer that authored the expression.
        layer: String,
        /// The authored expression text.
        expression: String,
        /// Why evaluation failed.
        message: String,
    },

    /// A single authored relocation is malformed.
    #[error("in @{layer}@ at {owning_path}: invalid relocation {source_path} -> {target}: {}", .reason.describe())]
    InvalidAuthoredRelocation {
        /// Identifier of the authoring layer.
        layer: String,
        /// Site that authored the relocation.
        owning_path: ScenePath,
        /// Authored source path.
        source_path: ScenePath,
        /// Authored target path.
        target: ScenePath,
        /// What is wrong with the pair.
        reason: InvalidRelocation,
    },

    /// Multiple relocations claim the same target; all of them are dropped.
    #[error("relocations from {} all target {target}", format_sources(.sources))]
    SameTargetRelocates {
        /// The contested target path.
        target: ScenePath,
        /// Every source claiming the target, with its authoring layer.
        sources: Vec<(ScenePath, String)>,
    },

    /// A relocation conflicts with another relocation in the same stack.
    #[error("relocation {source_path} -> {target}: {}", .conflict.describe())]
    ConflictingRelocation {
        /// Source of the dropped relocation.
        source_path: ScenePath,
        /// Target of the dropped relocation.
        target: ScenePath,
        /// The conflict kind.
        conflict: RelocationConflict,
        /// Source of the relocation it conflicts with.
        other_source: ScenePath,
        /// Target of the relocation it conflicts with.
        other_target: ScenePath,
    },
}

fn format_sources(sources: &[(ScenePath, String)]) -> String {
    let parts: Vec<String> = sources
        .iter()
        .map(|(src, layer)| format!("{src} (@{layer}@)"))
        .collect();
    parts.join(", ")
}

/// Sorts errors into a stable order for diffable diagnostics.
///
/// The underlying collections are hash-keyed, so insertion order is not
/// reproducible across runs; display text is a total, human-meaningful key.
pub fn sort_errors(errors: &mut [ComposeError]) {
    errors.sort_by_cached_key(|e| e.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_deterministically() {
        let a = ComposeError::SublayerCycle {
            layer: "b.layer".into(),
            sublayer: "a.layer".into(),
        };
        let b = ComposeError::InvalidSublayerPath {
            layer: "a.layer".into(),
            sublayer_path: "missing.layer".into(),
        };
        let mut v1 = vec![a.clone(), b.clone()];
        let mut v2 = vec![b, a];
        sort_errors(&mut v1);
        sort_errors(&mut v2);
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_display_same_target() {
        let e = ComposeError::SameTargetRelocates {
            target: ScenePath::new("/T"),
            sources: vec![
                (ScenePath::new("/A"), "one.layer".into()),
                (ScenePath::new("/B"), "two.layer".into()),
            ],
        };
        let text = e.to_string();
        assert!(text.contains("/A"));
        assert!(text.contains("/B"));
        assert!(text.contains("/T"));
    }
}
