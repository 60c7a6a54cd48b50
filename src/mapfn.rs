//! Map functions: path translations plus a time offset, attached to
//! dependency arcs and to per-subtree relocation views.

use crate::offset::TimeOffset;
use crate::path::ScenePath;

/// A namespace translation: ordered (source, target) path pairs applied by
/// longest-prefix match, plus a time offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapFunction {
    pairs: Vec<(ScenePath, ScenePath)>,
    time_offset: TimeOffset,
}

impl MapFunction {
    /// The identity map: root maps to root, identity time offset.
    pub fn identity() -> Self {
        MapFunction {
            pairs: vec![(ScenePath::absolute_root(), ScenePath::absolute_root())],
            time_offset: TimeOffset::identity(),
        }
    }

    /// An identity namespace map carrying a time offset.
    pub fn identity_with_offset(time_offset: TimeOffset) -> Self {
        MapFunction {
            pairs: vec![(ScenePath::absolute_root(), ScenePath::absolute_root())],
            time_offset,
        }
    }

    /// Creates a map function from explicit path pairs and a time offset.
    ///
    /// Pairs are sorted by source so that longest-prefix lookups and
    /// equality are deterministic.
    pub fn new(mut pairs: Vec<(ScenePath, ScenePath)>, time_offset: TimeOffset) -> Self {
        pairs.sort();
        pairs.dedup();
        MapFunction { pairs, time_offset }
    }

    /// The (source, target) pairs, sorted by source.
    pub fn pairs(&self) -> &[(ScenePath, ScenePath)] {
        &self.pairs
    }

    /// The time offset carried by this map.
    pub fn time_offset(&self) -> TimeOffset {
        self.time_offset
    }

    /// Maps a source path to the target namespace via the longest matching
    /// source prefix. Returns `None` if no pair applies.
    pub fn map_source_to_target(&self, path: &ScenePath) -> Option<ScenePath> {
        self.pairs
            .iter()
            .filter(|(src, _)| path.has_prefix(src))
            .max_by_key(|(src, _)| src.text().len())
            .map(|(src, tgt)| path.replace_prefix(src, tgt))
    }

    /// Maps a target path back to the source namespace.
    pub fn map_target_to_source(&self, path: &ScenePath) -> Option<ScenePath> {
        self.pairs
            .iter()
            .filter(|(_, tgt)| path.has_prefix(tgt))
            .max_by_key(|(_, tgt)| tgt.text().len())
            .map(|(src, tgt)| path.replace_prefix(tgt, src))
    }
}

impl Default for MapFunction {
    fn default() -> Self {
        MapFunction::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let f = MapFunction::new(
            vec![
                (ScenePath::new("/A"), ScenePath::new("/X")),
                (ScenePath::new("/A/B"), ScenePath::new("/Y")),
            ],
            TimeOffset::identity(),
        );
        assert_eq!(f.map_source_to_target(&ScenePath::new("/A/C")).unwrap().text(), "/X/C");
        assert_eq!(f.map_source_to_target(&ScenePath::new("/A/B/C")).unwrap().text(), "/Y/C");
        assert_eq!(f.map_target_to_source(&ScenePath::new("/Y/C")).unwrap().text(), "/A/B/C");
    }

    #[test]
    fn test_identity() {
        let f = MapFunction::identity();
        let p = ScenePath::new("/A/B");
        assert_eq!(f.map_source_to_target(&p).unwrap(), p);
    }
}
