// this_file: src/dependencies.rs

//! Glyph component dependency index.
//!
//! Directionality:
//! - `glyph_made_of`: glyph → the component glyphs it references.
//! - `glyph_used_by`: inverse index, "which glyphs reference this one?".
//!
//! Both indices store names only; there are no object cycles. The tracker
//! is fed on every successful glyph load and on every local mutation that
//! commits a glyph value. It never recomputes anything on its own; backends
//! with a glyphs-used-by capability consult it through the handler.

use crate::font::VariableGlyph;
use std::collections::{HashMap, HashSet};

/// Symmetric component dependency index across glyphs.
#[derive(Clone, Debug, Default)]
pub struct DependencyTracker {
    glyph_made_of: HashMap<String, HashSet<String>>,
    glyph_used_by: HashMap<String, HashSet<String>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        DependencyTracker::default()
    }

    /// Replace the recorded component edges of `glyph_name` with the
    /// components found in `glyph`. Passing `None` clears the edges (the
    /// glyph was deleted or lost its value).
    pub fn update_glyph(&mut self, glyph_name: &str, glyph: Option<&VariableGlyph>) {
        let components: HashSet<String> = glyph
            .map(|glyph| glyph.component_names().map(str::to_string).collect())
            .unwrap_or_default();
        self.set_components(glyph_name, components);
    }

    fn set_components(&mut self, glyph_name: &str, components: HashSet<String>) {
        // Zap previous used-by entries for this glyph, if any.
        if let Some(previous) = self.glyph_made_of.get(glyph_name) {
            for component in previous {
                if let Some(users) = self.glyph_used_by.get_mut(component) {
                    users.remove(glyph_name);
                    if users.is_empty() {
                        self.glyph_used_by.remove(component);
                    }
                }
            }
        }
        if components.is_empty() {
            self.glyph_made_of.remove(glyph_name);
            return;
        }
        for component in &components {
            self.glyph_used_by
                .entry(component.clone())
                .or_default()
                .insert(glyph_name.to_string());
        }
        self.glyph_made_of.insert(glyph_name.to_string(), components);
    }

    /// The components `glyph_name` directly references.
    pub fn made_of(&self, glyph_name: &str) -> Vec<String> {
        self.sorted(self.glyph_made_of.get(glyph_name))
    }

    /// The glyphs directly referencing `glyph_name` as a component.
    pub fn used_by(&self, glyph_name: &str) -> Vec<String> {
        self.sorted(self.glyph_used_by.get(glyph_name))
    }

    fn sorted(&self, names: Option<&HashSet<String>>) -> Vec<String> {
        let mut names: Vec<String> = names
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
