// this_file: src/cache.rs

//! Local font-data cache.
//!
//! The handler caches backend data at [`DataKey`] granularity: the four
//! font-wide root values plus one entry per glyph. The store is a plain
//! `lru` map without interior locking; all access is serialized by the
//! handler's state lock.

use crate::error::{Error, Result};
use crate::font::{CustomData, FontAxis, GlyphMap, VariableGlyph};
use crate::pattern::{Path, Pattern};
use lru::LruCache;
use serde_json::Value;
use std::fmt;
use std::num::NonZeroUsize;

/// Default number of cache entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// The non-glyph roots of the font data tree.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum RootKey {
    Axes,
    GlyphMap,
    CustomData,
    UnitsPerEm,
}

impl RootKey {
    /// All root keys, in wire-name order.
    pub const ALL: [RootKey; 4] = [
        RootKey::Axes,
        RootKey::CustomData,
        RootKey::GlyphMap,
        RootKey::UnitsPerEm,
    ];

    /// The wire name of this root.
    pub fn name(&self) -> &'static str {
        match self {
            RootKey::Axes => "axes",
            RootKey::GlyphMap => "glyphMap",
            RootKey::CustomData => "customData",
            RootKey::UnitsPerEm => "unitsPerEm",
        }
    }

    /// Parse a wire name. Unknown names are the caller's key error.
    pub fn from_name(name: &str) -> Option<RootKey> {
        match name {
            "axes" => Some(RootKey::Axes),
            "glyphMap" => Some(RootKey::GlyphMap),
            "customData" => Some(RootKey::CustomData),
            "unitsPerEm" => Some(RootKey::UnitsPerEm),
            _ => None,
        }
    }
}

impl fmt::Display for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of one cache entry (and of one pending write).
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataKey {
    /// A font-wide root value.
    Root(RootKey),
    /// A single glyph.
    Glyph(String),
}

impl DataKey {
    /// Key for the glyph `name`.
    pub fn glyph(name: impl Into<String>) -> DataKey {
        DataKey::Glyph(name.into())
    }

    /// The path this key occupies in the font data tree.
    pub fn to_path(&self) -> Path {
        match self {
            DataKey::Root(root) => vec![root.name().into()],
            DataKey::Glyph(name) => vec!["glyphs".into(), name.as_str().into()],
        }
    }

    /// The pattern selecting exactly this key's subtree.
    pub fn to_pattern(&self) -> Pattern {
        Pattern::from_path(&self.to_path())
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKey::Root(root) => write!(f, "{}", root),
            DataKey::Glyph(name) => write!(f, "glyphs/{}", name),
        }
    }
}

/// A cached value, typed by its key.
///
/// `Glyph(None)` records a backend miss: the name is known to the cache
/// (and therefore part of the local data pattern) but has no value.
#[derive(Clone, Debug, PartialEq)]
pub enum CachedValue {
    Axes(Vec<FontAxis>),
    GlyphMap(GlyphMap),
    CustomData(CustomData),
    UnitsPerEm(u32),
    Glyph(Option<VariableGlyph>),
}

impl CachedValue {
    /// JSON form, for the change-application tree.
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            CachedValue::Axes(axes) => serde_json::to_value(axes)?,
            CachedValue::GlyphMap(map) => serde_json::to_value(map)?,
            CachedValue::CustomData(data) => serde_json::to_value(data)?,
            CachedValue::UnitsPerEm(upm) => serde_json::to_value(upm)?,
            CachedValue::Glyph(glyph) => serde_json::to_value(glyph)?,
        };
        Ok(value)
    }

    /// Rebuild a root value from its JSON form.
    pub fn from_root_value(root: RootKey, value: Value) -> Result<CachedValue> {
        let cached = match root {
            RootKey::Axes => CachedValue::Axes(serde_json::from_value(value)?),
            RootKey::GlyphMap => CachedValue::GlyphMap(serde_json::from_value(value)?),
            RootKey::CustomData => CachedValue::CustomData(serde_json::from_value(value)?),
            RootKey::UnitsPerEm => CachedValue::UnitsPerEm(serde_json::from_value(value)?),
        };
        Ok(cached)
    }

    /// Rebuild a glyph value from its JSON form.
    pub fn glyph_from_value(value: Value) -> Result<CachedValue> {
        Ok(CachedValue::Glyph(serde_json::from_value(value)?))
    }

    /// The glyph inside, if this is a glyph entry.
    pub fn as_glyph(&self) -> Result<Option<&VariableGlyph>> {
        match self {
            CachedValue::Glyph(glyph) => Ok(glyph.as_ref()),
            other => Err(Error::InvalidParameter(format!(
                "expected a glyph entry, got {:?}",
                other
            ))),
        }
    }

    pub fn into_axes(self) -> Result<Vec<FontAxis>> {
        match self {
            CachedValue::Axes(axes) => Ok(axes),
            other => Err(Self::mismatch("axes", &other)),
        }
    }

    pub fn into_glyph_map(self) -> Result<GlyphMap> {
        match self {
            CachedValue::GlyphMap(map) => Ok(map),
            other => Err(Self::mismatch("glyphMap", &other)),
        }
    }

    pub fn into_custom_data(self) -> Result<CustomData> {
        match self {
            CachedValue::CustomData(data) => Ok(data),
            other => Err(Self::mismatch("customData", &other)),
        }
    }

    pub fn into_units_per_em(self) -> Result<u32> {
        match self {
            CachedValue::UnitsPerEm(upm) => Ok(upm),
            other => Err(Self::mismatch("unitsPerEm", &other)),
        }
    }

    fn mismatch(expected: &str, got: &CachedValue) -> Error {
        Error::InvalidParameter(format!("expected a {} entry, got {:?}", expected, got))
    }
}

/// Bounded LRU store of [`CachedValue`]s.
pub struct LocalCache {
    entries: LruCache<DataKey, CachedValue>,
}

impl LocalCache {
    /// Create a cache with the requested capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity is nonzero");
        LocalCache {
            entries: LruCache::new(cap),
        }
    }

    /// Retrieve an entry, refreshing its recency.
    pub fn get(&mut self, key: &DataKey) -> Option<&CachedValue> {
        self.entries.get(key)
    }

    /// Insert or replace an entry, evicting the least recently used entry
    /// when over capacity.
    pub fn insert(&mut self, key: DataKey, value: CachedValue) {
        self.entries.put(key, value);
    }

    /// Remove an entry. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &DataKey) -> Option<CachedValue> {
        self.entries.pop(key)
    }

    /// Current keys, most recently used first.
    pub fn keys(&self) -> impl Iterator<Item = &DataKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    /// The pattern covering everything currently cached.
    pub fn local_data_pattern(&self) -> Pattern {
        let mut pattern = Pattern::new();
        let mut glyphs = Pattern::new();
        for key in self.keys() {
            match key {
                DataKey::Root(root) => pattern.insert_sentinel(root.name()),
                DataKey::Glyph(name) => glyphs.insert_sentinel(name.clone()),
            }
        }
        if !glyphs.is_empty() {
            pattern.insert_nested("glyphs", glyphs);
        }
        pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_by_key() {
        let mut cache = LocalCache::new(8);
        cache.insert(
            DataKey::Root(RootKey::UnitsPerEm),
            CachedValue::UnitsPerEm(1000),
        );
        cache.insert(DataKey::glyph("A"), CachedValue::Glyph(None));
        assert_eq!(
            cache.get(&DataKey::Root(RootKey::UnitsPerEm)),
            Some(&CachedValue::UnitsPerEm(1000))
        );
        assert_eq!(cache.get(&DataKey::glyph("A")), Some(&CachedValue::Glyph(None)));
        assert!(cache.get(&DataKey::glyph("B")).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut cache = LocalCache::new(8);
        cache.insert(DataKey::glyph("A"), CachedValue::Glyph(None));
        assert!(cache.remove(&DataKey::glyph("A")).is_some());
        assert!(cache.remove(&DataKey::glyph("A")).is_none());
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LocalCache::new(2);
        cache.insert(DataKey::glyph("A"), CachedValue::Glyph(None));
        cache.insert(DataKey::glyph("B"), CachedValue::Glyph(None));
        // Refresh "A", then overflow: "B" is the eviction victim.
        cache.get(&DataKey::glyph("A"));
        cache.insert(DataKey::glyph("C"), CachedValue::Glyph(None));
        assert!(cache.get(&DataKey::glyph("A")).is_some());
        assert!(cache.get(&DataKey::glyph("B")).is_none());
        assert!(cache.get(&DataKey::glyph("C")).is_some());
    }

    #[test]
    fn local_data_pattern_reflects_key_set() {
        let mut cache = LocalCache::new(8);
        cache.insert(
            DataKey::Root(RootKey::UnitsPerEm),
            CachedValue::UnitsPerEm(1000),
        );
        cache.insert(DataKey::glyph("A"), CachedValue::Glyph(None));
        let pattern = cache.local_data_pattern();
        assert!(pattern.contains_path(&["unitsPerEm".into()]));
        assert!(pattern.contains_path(&["glyphs".into(), "A".into()]));
        assert!(!pattern.contains_path(&["glyphs".into(), "B".into()]));
        assert!(!pattern.contains_path(&["axes".into()]));
    }

    #[test]
    fn root_keys_round_trip_their_names() {
        for root in RootKey::ALL {
            assert_eq!(RootKey::from_name(root.name()), Some(root));
        }
        assert_eq!(RootKey::from_name("bogus"), None);
    }
}
