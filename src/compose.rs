// this_file: src/compose.rs

//! Read-side backend composition.
//!
//! [`MergedBackend`] overlays one readable backend on another: the second
//! input wins wherever both define a value, glyph maps and custom data are
//! merged key-wise. The merge is read-only; it carries no write or watch
//! capability.

use crate::backend::ReadBackend;
use crate::error::Result;
use crate::font::{CustomData, FontAxis, GlyphMap, VariableGlyph};
use async_trait::async_trait;
use std::sync::Arc;

/// Two readable backends merged into one, the second overriding the first.
pub struct MergedBackend {
    base: Arc<dyn ReadBackend>,
    overlay: Arc<dyn ReadBackend>,
    name: String,
}

impl MergedBackend {
    pub fn new(base: Arc<dyn ReadBackend>, overlay: Arc<dyn ReadBackend>) -> Self {
        let name = format!("{}+{}", base.name(), overlay.name());
        MergedBackend {
            base,
            overlay,
            name,
        }
    }
}

#[async_trait]
impl ReadBackend for MergedBackend {
    async fn get_glyph(&self, glyph_name: &str) -> Result<Option<VariableGlyph>> {
        if let Some(glyph) = self.overlay.get_glyph(glyph_name).await? {
            return Ok(Some(glyph));
        }
        self.base.get_glyph(glyph_name).await
    }

    async fn get_global_axes(&self) -> Result<Vec<FontAxis>> {
        let axes = self.overlay.get_global_axes().await?;
        if axes.is_empty() {
            return self.base.get_global_axes().await;
        }
        Ok(axes)
    }

    async fn get_glyph_map(&self) -> Result<GlyphMap> {
        let mut merged = self.base.get_glyph_map().await?;
        merged.extend(self.overlay.get_glyph_map().await?);
        Ok(merged)
    }

    async fn get_custom_data(&self) -> Result<CustomData> {
        let mut merged = self.base.get_custom_data().await?;
        merged.extend(self.overlay.get_custom_data().await?);
        Ok(merged)
    }

    async fn get_units_per_em(&self) -> Result<u32> {
        self.overlay.get_units_per_em().await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        self.base.close();
        self.overlay.close();
    }
}
