// this_file: src/backend.rs

//! Backend capability traits.
//!
//! A backend is handed to the handler as `Arc<dyn ReadBackend>`. Optional
//! capabilities are exposed as accessor methods returning trait objects:
//! [`ReadBackend::writable`] for persistence, [`ReadBackend::watchable`]
//! for external-change feeds, [`ReadBackend::glyph_usage`] for a native
//! glyphs-used-by query. A backend without the writable capability forces
//! the handler into read-only mode.

use crate::changes::Change;
use crate::error::Result;
use crate::font::{CustomData, FontAxis, GlyphMap, VariableGlyph};
use crate::pattern::Pattern;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// One event from a watchable backend.
///
/// Either field may be absent; an event with neither is a no-op.
#[derive(Clone, Debug, Default)]
pub struct ExternalEvent {
    /// A change some other process applied to the stored font.
    pub change: Option<Change>,
    /// Regions whose stored data changed beyond what `change` describes.
    pub reload_pattern: Option<Pattern>,
}

/// Lazy, possibly infinite feed of external events.
pub type ExternalEventStream = BoxStream<'static, ExternalEvent>;

/// Read access to a stored font.
///
/// Dyn-compatible; the handler only ever holds `Arc<dyn ReadBackend>`.
#[async_trait]
pub trait ReadBackend: Send + Sync {
    /// Load a glyph. `Ok(None)` when the glyph does not exist.
    async fn get_glyph(&self, glyph_name: &str) -> Result<Option<VariableGlyph>>;

    /// Load the font-wide axes.
    async fn get_global_axes(&self) -> Result<Vec<FontAxis>>;

    /// Load the glyph name → codepoints mapping.
    async fn get_glyph_map(&self) -> Result<GlyphMap>;

    /// Load the free-form font-wide data.
    async fn get_custom_data(&self) -> Result<CustomData>;

    /// Load the units-per-em value.
    async fn get_units_per_em(&self) -> Result<u32>;

    /// Human-readable backend name, reported to clients.
    fn name(&self) -> &str;

    /// Release underlying resources. Called exactly once by the handler.
    fn close(&self) {}

    /// The write capability, when this backend can persist edits.
    fn writable(&self) -> Option<&dyn WriteBackend> {
        None
    }

    /// The watch capability, when this backend can report external changes.
    fn watchable(&self) -> Option<&dyn WatchBackend> {
        None
    }

    /// A native glyphs-used-by query, preferred over the handler's own
    /// dependency tracker when present.
    fn glyph_usage(&self) -> Option<&dyn GlyphUsageBackend> {
        None
    }
}

/// Write access to a stored font.
#[async_trait]
pub trait WriteBackend: Send + Sync {
    /// Store a glyph under `glyph_name` with its codepoints.
    async fn put_glyph(
        &self,
        glyph_name: &str,
        glyph: VariableGlyph,
        codepoints: Vec<u32>,
    ) -> Result<()>;

    /// Remove a glyph.
    async fn delete_glyph(&self, glyph_name: &str) -> Result<()>;

    async fn put_global_axes(&self, axes: Vec<FontAxis>) -> Result<()>;

    async fn put_glyph_map(&self, glyph_map: GlyphMap) -> Result<()>;

    async fn put_custom_data(&self, custom_data: CustomData) -> Result<()>;

    async fn put_units_per_em(&self, units_per_em: u32) -> Result<()>;
}

/// External-change feed capability.
#[async_trait]
pub trait WatchBackend: Send + Sync {
    /// Open the feed. The stream ends when the backend stops watching.
    async fn watch_external_changes(&self) -> Result<ExternalEventStream>;
}

/// Native glyphs-used-by capability.
#[async_trait]
pub trait GlyphUsageBackend: Send + Sync {
    /// Names of the glyphs using `glyph_name` as a component.
    async fn get_glyphs_used_by(&self, glyph_name: &str) -> Result<Vec<String>>;
}

/// Description of the backend, reported to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    pub features: BackendFeatures,
}

/// Feature flags advertised through [`BackendInfo`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFeatures {
    #[serde(rename = "glyphs-used-by")]
    pub glyphs_used_by: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_flags_use_protocol_names() {
        let info = BackendInfo {
            name: "memory".to_string(),
            features: BackendFeatures {
                glyphs_used_by: true,
            },
        };
        let wire = serde_json::to_value(&info).unwrap();
        assert_eq!(wire["features"]["glyphs-used-by"], serde_json::json!(true));
    }
}
