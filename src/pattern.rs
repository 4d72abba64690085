// this_file: src/pattern.rs

//! Paths and match patterns over the font data tree.
//!
//! A [`Pattern`] is a prefix tree describing a set of paths: every key maps
//! either to a nested pattern or to the sentinel (`None`), which stands for
//! "everything below this node". Patterns are what clients subscribe with,
//! what reload requests carry, and what changes are matched and filtered
//! against. They form a lattice under [`Pattern::union`],
//! [`Pattern::difference`] and [`Pattern::intersect`].
//!
//! Pattern keys are strings. Integer path elements are stringified when they
//! enter a pattern, which matches the editor protocol where patterns travel
//! as JSON objects (whose keys are always strings).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One segment of a path into the font data tree.
///
/// Serialized untagged: numbers deserialize as [`PathElement::Index`],
/// strings as [`PathElement::Key`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// List index
    Index(u64),
    /// Mapping key
    Key(String),
}

impl PathElement {
    /// The pattern-key form of this element.
    pub fn pattern_key(&self) -> String {
        match self {
            PathElement::Index(i) => i.to_string(),
            PathElement::Key(k) => k.clone(),
        }
    }

    /// Borrowed key name, if this element is a mapping key.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathElement::Key(k) => Some(k.as_str()),
            PathElement::Index(_) => None,
        }
    }
}

impl From<&str> for PathElement {
    fn from(key: &str) -> Self {
        PathElement::Key(key.to_string())
    }
}

impl From<String> for PathElement {
    fn from(key: String) -> Self {
        PathElement::Key(key)
    }
}

impl From<usize> for PathElement {
    fn from(index: usize) -> Self {
        PathElement::Index(index as u64)
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Index(i) => write!(f, "{}", i),
            PathElement::Key(k) => write!(f, "{}", k),
        }
    }
}

/// A path into the font data tree.
pub type Path = Vec<PathElement>;

/// Prefix-tree set of paths.
///
/// `None` values are the sentinel: the full subtree below that key is part
/// of the pattern. The empty pattern matches nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(BTreeMap<String, Option<Pattern>>);

impl Pattern {
    /// The empty pattern.
    pub fn new() -> Self {
        Pattern::default()
    }

    /// Build the pattern selecting exactly the subtree at `path`.
    ///
    /// The empty path yields the empty pattern: there is no way to select
    /// the root itself, only parts of it.
    pub fn from_path(path: &[PathElement]) -> Self {
        let mut pattern = Pattern::new();
        let Some((first, rest)) = path.split_first() else {
            return pattern;
        };
        let value = if rest.is_empty() {
            None
        } else {
            Some(Pattern::from_path(rest))
        };
        pattern.0.insert(first.pattern_key(), value);
        pattern
    }

    /// True when the pattern selects nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up the entry for `key`: absent, sentinel (`Some(None)`), or a
    /// nested pattern.
    pub fn get(&self, key: &str) -> Option<&Option<Pattern>> {
        self.0.get(key)
    }

    /// Iterate over the top-level entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Option<Pattern>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Insert `key` mapping to the sentinel.
    pub fn insert_sentinel(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), None);
    }

    /// Insert `key` mapping to a nested pattern.
    pub fn insert_nested(&mut self, key: impl Into<String>, nested: Pattern) {
        self.0.insert(key.into(), Some(nested));
    }

    /// True when walking `path` through the pattern terminates at a sentinel
    /// or at an empty subtree.
    pub fn contains_path(&self, path: &[PathElement]) -> bool {
        let mut node = self;
        for element in path {
            match node.get(&element.pattern_key()) {
                None => return false,
                Some(None) => return true,
                Some(Some(sub)) => {
                    if sub.is_empty() {
                        return true;
                    }
                    node = sub;
                }
            }
        }
        false
    }

    /// Lattice join: paths selected by either pattern.
    pub fn union(&self, other: &Pattern) -> Pattern {
        let mut result = self.clone();
        for (key, value) in &other.0 {
            let merged = match (result.0.get(key), value) {
                (None, v) => v.clone(),
                (Some(None), _) | (Some(_), None) => None,
                (Some(Some(a)), Some(b)) => Some(a.union(b)),
            };
            result.0.insert(key.clone(), merged);
        }
        result
    }

    /// Lattice subtraction: paths selected by `self` but not by `other`.
    ///
    /// A sentinel on the left cannot be narrowed by a partial pattern on the
    /// right: the prefix tree cannot represent "everything except".
    pub fn difference(&self, other: &Pattern) -> Pattern {
        let mut result = Pattern::new();
        for (key, value) in &self.0 {
            match (value, other.0.get(key)) {
                (v, None) => {
                    result.0.insert(key.clone(), v.clone());
                }
                (_, Some(None)) => {}
                (None, Some(Some(_))) => {
                    result.0.insert(key.clone(), None);
                }
                (Some(a), Some(Some(b))) => {
                    let diff = a.difference(b);
                    if !diff.is_empty() {
                        result.0.insert(key.clone(), Some(diff));
                    }
                }
            }
        }
        result
    }

    /// Lattice meet: paths selected by both patterns.
    pub fn intersect(&self, other: &Pattern) -> Pattern {
        let mut result = Pattern::new();
        for (key, value) in &self.0 {
            let Some(other_value) = other.0.get(key) else {
                continue;
            };
            match (value, other_value) {
                (None, v) | (v, None) => {
                    result.0.insert(key.clone(), v.clone());
                }
                (Some(a), Some(b)) => {
                    let meet = a.intersect(b);
                    if !meet.is_empty() {
                        result.0.insert(key.clone(), Some(meet));
                    }
                }
            }
        }
        result
    }
}

/// Wire argument accepted wherever either a path or a pattern makes sense.
///
/// Clients may subscribe with a plain path (a JSON array) or a structured
/// pattern (a JSON object).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathOrPattern {
    /// An ordered path, converted with [`Pattern::from_path`].
    Path(Path),
    /// An already structured pattern.
    Pattern(Pattern),
}

impl PathOrPattern {
    /// Resolve to a pattern.
    pub fn into_pattern(self) -> Pattern {
        match self {
            PathOrPattern::Path(path) => Pattern::from_path(&path),
            PathOrPattern::Pattern(pattern) => pattern,
        }
    }
}

impl From<Pattern> for PathOrPattern {
    fn from(pattern: Pattern) -> Self {
        PathOrPattern::Pattern(pattern)
    }
}

impl From<Path> for PathOrPattern {
    fn from(path: Path) -> Self {
        PathOrPattern::Path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glyph_pattern(names: &[&str]) -> Pattern {
        let mut glyphs = Pattern::new();
        for name in names {
            glyphs.insert_sentinel(*name);
        }
        let mut pattern = Pattern::new();
        pattern.insert_nested("glyphs", glyphs);
        pattern
    }

    #[test]
    fn from_path_builds_nested_sentinel() {
        let pattern = Pattern::from_path(&["glyphs".into(), "A".into()]);
        assert_eq!(pattern, glyph_pattern(&["A"]));
    }

    #[test]
    fn from_path_stringifies_indices() {
        let pattern = Pattern::from_path(&["axes".into(), PathElement::Index(0)]);
        assert!(pattern.contains_path(&["axes".into(), PathElement::Index(0)]));
        assert!(!pattern.contains_path(&["axes".into(), PathElement::Index(1)]));
    }

    #[test]
    fn contains_path_descends_past_sentinel() {
        let pattern = glyph_pattern(&["A"]);
        assert!(pattern.contains_path(&["glyphs".into(), "A".into()]));
        assert!(pattern.contains_path(&["glyphs".into(), "A".into(), "layers".into()]));
        assert!(!pattern.contains_path(&["glyphs".into(), "B".into()]));
        assert!(!pattern.contains_path(&["glyphs".into()]));
    }

    #[test]
    fn union_merges_and_absorbs() {
        let a = glyph_pattern(&["A"]);
        let b = glyph_pattern(&["B"]);
        let both = a.union(&b);
        assert!(both.contains_path(&["glyphs".into(), "A".into()]));
        assert!(both.contains_path(&["glyphs".into(), "B".into()]));

        let whole = Pattern::from_path(&["glyphs".into()]);
        let absorbed = a.union(&whole);
        assert!(absorbed.contains_path(&["glyphs".into()]));
        assert!(absorbed.contains_path(&["glyphs".into(), "Q".into()]));
    }

    #[test]
    fn difference_restores_prior_subscription() {
        let base = glyph_pattern(&["A"]);
        let extra = glyph_pattern(&["B"]);
        let combined = base.union(&extra);
        assert_eq!(combined.difference(&extra), base);
        assert_eq!(base.difference(&base), Pattern::new());
    }

    #[test]
    fn intersect_keeps_common_paths_only() {
        let a = glyph_pattern(&["A", "B"]);
        let b = glyph_pattern(&["B", "C"]);
        assert_eq!(a.intersect(&b), glyph_pattern(&["B"]));

        let whole = Pattern::from_path(&["glyphs".into()]);
        assert_eq!(whole.intersect(&a), a);
        assert_eq!(a.intersect(&whole), a);

        let axes = Pattern::from_path(&["axes".into()]);
        assert!(a.intersect(&axes).is_empty());
    }

    #[test]
    fn serde_round_trip_keeps_sentinels() {
        let pattern = glyph_pattern(&["A"]);
        let json = serde_json::to_string(&pattern).unwrap();
        assert_eq!(json, r#"{"glyphs":{"A":null}}"#);
        let back: Pattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn path_or_pattern_accepts_both_wire_forms() {
        let from_path: PathOrPattern = serde_json::from_str(r#"["glyphs","A"]"#).unwrap();
        let from_pattern: PathOrPattern =
            serde_json::from_str(r#"{"glyphs":{"A":null}}"#).unwrap();
        assert_eq!(from_path.into_pattern(), from_pattern.into_pattern());
    }
}
