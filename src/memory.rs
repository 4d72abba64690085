// this_file: src/memory.rs

//! In-memory font backend.
//!
//! Backs a whole font with plain maps behind a mutex. Used for tests and
//! local tooling; also the reference implementation of the capability
//! accessors. Writability and watchability are construction-time choices,
//! so a read-only or watch-capable store can be modeled directly.

use crate::backend::{
    ExternalEvent, ExternalEventStream, GlyphUsageBackend, ReadBackend, WatchBackend,
    WriteBackend,
};
use crate::error::Result;
use crate::font::{CustomData, FontAxis, GlyphMap, VariableGlyph};
use async_trait::async_trait;
use futures::stream;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Default)]
struct FontStore {
    axes: Vec<FontAxis>,
    glyph_map: GlyphMap,
    custom_data: CustomData,
    units_per_em: u32,
    glyphs: BTreeMap<String, VariableGlyph>,
}

/// A font held entirely in memory.
pub struct MemoryBackend {
    name: String,
    writable: bool,
    watchable: bool,
    store: Mutex<FontStore>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<ExternalEvent>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            name: "memory".to_string(),
            writable: true,
            watchable: false,
            store: Mutex::new(FontStore {
                units_per_em: 1000,
                ..FontStore::default()
            }),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Drop the write capability.
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Expose the watch capability; events are pushed with
    /// [`MemoryBackend::emit_external`].
    pub fn watching(mut self) -> Self {
        self.watchable = true;
        self
    }

    /// Seed a glyph and its codepoints.
    pub fn insert_glyph(&self, glyph: VariableGlyph, codepoints: Vec<u32>) {
        let mut store = self.lock_store();
        store.glyph_map.insert(glyph.name.clone(), codepoints);
        store.glyphs.insert(glyph.name.clone(), glyph);
    }

    pub fn set_global_axes(&self, axes: Vec<FontAxis>) {
        self.lock_store().axes = axes;
    }

    pub fn set_units_per_em(&self, units_per_em: u32) {
        self.lock_store().units_per_em = units_per_em;
    }

    pub fn set_custom_data(&self, custom_data: CustomData) {
        self.lock_store().custom_data = custom_data;
    }

    /// Inspect a stored glyph.
    pub fn stored_glyph(&self, glyph_name: &str) -> Option<VariableGlyph> {
        self.lock_store().glyphs.get(glyph_name).cloned()
    }

    /// Inspect the stored glyph map.
    pub fn stored_glyph_map(&self) -> GlyphMap {
        self.lock_store().glyph_map.clone()
    }

    /// Push an event to all open watch streams.
    pub fn emit_external(&self, event: ExternalEvent) {
        let mut watchers = self.watchers.lock().expect("watcher list mutex poisoned");
        watchers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, FontStore> {
        self.store.lock().expect("font store mutex poisoned")
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new()
    }
}

#[async_trait]
impl ReadBackend for MemoryBackend {
    async fn get_glyph(&self, glyph_name: &str) -> Result<Option<VariableGlyph>> {
        Ok(self.lock_store().glyphs.get(glyph_name).cloned())
    }

    async fn get_global_axes(&self) -> Result<Vec<FontAxis>> {
        Ok(self.lock_store().axes.clone())
    }

    async fn get_glyph_map(&self) -> Result<GlyphMap> {
        Ok(self.lock_store().glyph_map.clone())
    }

    async fn get_custom_data(&self) -> Result<CustomData> {
        Ok(self.lock_store().custom_data.clone())
    }

    async fn get_units_per_em(&self) -> Result<u32> {
        Ok(self.lock_store().units_per_em)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn writable(&self) -> Option<&dyn WriteBackend> {
        self.writable.then_some(self as &dyn WriteBackend)
    }

    fn watchable(&self) -> Option<&dyn WatchBackend> {
        self.watchable.then_some(self as &dyn WatchBackend)
    }

    fn glyph_usage(&self) -> Option<&dyn GlyphUsageBackend> {
        Some(self)
    }
}

#[async_trait]
impl WriteBackend for MemoryBackend {
    async fn put_glyph(
        &self,
        glyph_name: &str,
        glyph: VariableGlyph,
        codepoints: Vec<u32>,
    ) -> Result<()> {
        let mut store = self.lock_store();
        store.glyph_map.insert(glyph_name.to_string(), codepoints);
        store.glyphs.insert(glyph_name.to_string(), glyph);
        Ok(())
    }

    async fn delete_glyph(&self, glyph_name: &str) -> Result<()> {
        let mut store = self.lock_store();
        store.glyphs.remove(glyph_name);
        store.glyph_map.remove(glyph_name);
        Ok(())
    }

    async fn put_global_axes(&self, axes: Vec<FontAxis>) -> Result<()> {
        self.lock_store().axes = axes;
        Ok(())
    }

    async fn put_glyph_map(&self, glyph_map: GlyphMap) -> Result<()> {
        self.lock_store().glyph_map = glyph_map;
        Ok(())
    }

    async fn put_custom_data(&self, custom_data: CustomData) -> Result<()> {
        self.lock_store().custom_data = custom_data;
        Ok(())
    }

    async fn put_units_per_em(&self, units_per_em: u32) -> Result<()> {
        self.lock_store().units_per_em = units_per_em;
        Ok(())
    }
}

#[async_trait]
impl WatchBackend for MemoryBackend {
    async fn watch_external_changes(&self) -> Result<ExternalEventStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .expect("watcher list mutex poisoned")
            .push(sender);
        let stream = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl GlyphUsageBackend for MemoryBackend {
    async fn get_glyphs_used_by(&self, glyph_name: &str) -> Result<Vec<String>> {
        let store = self.lock_store();
        let mut users: Vec<String> = store
            .glyphs
            .iter()
            .filter(|(_, glyph)| {
                glyph
                    .component_names()
                    .any(|component| component == glyph_name)
            })
            .map(|(name, _)| name.clone())
            .collect();
        users.sort();
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::{Component, Layer, StaticGlyph};
    use futures::StreamExt;

    fn glyph(name: &str, components: &[&str]) -> VariableGlyph {
        let mut layers = BTreeMap::new();
        layers.insert(
            "default".to_string(),
            Layer {
                glyph: StaticGlyph {
                    components: components
                        .iter()
                        .map(|component| Component {
                            name: component.to_string(),
                            ..Component::default()
                        })
                        .collect(),
                    ..StaticGlyph::default()
                },
            },
        );
        VariableGlyph {
            name: name.to_string(),
            layers,
            ..VariableGlyph::default()
        }
    }

    #[tokio::test]
    async fn read_write_round_trip() {
        let backend = MemoryBackend::new();
        backend.insert_glyph(glyph("A", &[]), vec![0x41]);

        let loaded = backend.get_glyph("A").await.unwrap().unwrap();
        assert_eq!(loaded.name, "A");
        assert_eq!(backend.get_glyph_map().await.unwrap()["A"], vec![0x41]);

        let writable = backend.writable().expect("writable capability");
        writable.delete_glyph("A").await.unwrap();
        assert!(backend.get_glyph("A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_only_store_drops_write_capability() {
        let backend = MemoryBackend::new().read_only();
        assert!(backend.writable().is_none());
        assert!(backend.watchable().is_none());
    }

    #[tokio::test]
    async fn watch_stream_delivers_emitted_events() {
        let backend = MemoryBackend::new().watching();
        let mut stream = backend
            .watchable()
            .expect("watch capability")
            .watch_external_changes()
            .await
            .unwrap();
        backend.emit_external(ExternalEvent {
            change: None,
            reload_pattern: Some(crate::pattern::Pattern::from_path(&["glyphs".into()])),
        });
        let event = stream.next().await.expect("one event");
        assert!(event.reload_pattern.is_some());
    }

    #[tokio::test]
    async fn glyph_usage_scans_components() {
        let backend = MemoryBackend::new();
        backend.insert_glyph(glyph("A", &[]), vec![0x41]);
        backend.insert_glyph(glyph("Aacute", &["A", "acutecomb"]), vec![0xC1]);
        let usage = backend.glyph_usage().expect("usage capability");
        assert_eq!(usage.get_glyphs_used_by("A").await.unwrap(), vec!["Aacute"]);
        assert!(usage.get_glyphs_used_by("B").await.unwrap().is_empty());
    }
}
