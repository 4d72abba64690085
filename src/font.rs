// this_file: src/font.rs

//! Font data model.
//!
//! Typed serde mirror of the editor protocol's JSON shapes (camelCase on
//! the wire). Only the parts the session core needs are modeled richly;
//! `customData` stays an open mapping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Glyph name → codepoints.
pub type GlyphMap = BTreeMap<String, Vec<u32>>;

/// Free-form font-wide data.
pub type CustomData = serde_json::Map<String, serde_json::Value>;

/// A font-wide design axis.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FontAxis {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub tag: String,
    pub min_value: f64,
    pub default_value: f64,
    pub max_value: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

/// A glyph-local design axis.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlyphAxis {
    pub name: String,
    pub min_value: f64,
    pub default_value: f64,
    pub max_value: f64,
}

/// A design-space source of a glyph, pointing at one of its layers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlyphSource {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub location: BTreeMap<String, f64>,
    pub layer_name: String,
}

/// An editable glyph with one or more layers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableGlyph {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub axes: Vec<GlyphAxis>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<GlyphSource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub layers: BTreeMap<String, Layer>,
}

impl VariableGlyph {
    /// Names of all glyphs referenced as components, across all layers.
    ///
    /// Duplicates are preserved; callers needing a set collect one.
    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.layers
            .values()
            .flat_map(|layer| layer.glyph.components.iter())
            .map(|component| component.name.as_str())
    }
}

/// One layer of a glyph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub glyph: StaticGlyph,
}

/// The drawable content of a single layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticGlyph {
    #[serde(default, skip_serializing_if = "PackedPath::is_empty")]
    pub path: PackedPath,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Component>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_advance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_advance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_origin: Option<f64>,
}

/// Packed outline data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackedPath {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coordinates: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub point_types: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contour_info: Vec<ContourInfo>,
}

impl PackedPath {
    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty() && self.contour_info.is_empty()
    }
}

/// Per-contour bookkeeping for a [`PackedPath`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContourInfo {
    pub end_point: usize,
    pub is_closed: bool,
}

/// A reference to another glyph, placed with a transformation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    #[serde(default, skip_serializing_if = "Transformation::is_identity")]
    pub transformation: Transformation,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub location: BTreeMap<String, f64>,
}

/// Decomposed affine transformation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transformation {
    #[serde(default)]
    pub translate_x: f64,
    #[serde(default)]
    pub translate_y: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "default_scale")]
    pub scale_x: f64,
    #[serde(default = "default_scale")]
    pub scale_y: f64,
    #[serde(default)]
    pub skew_x: f64,
    #[serde(default)]
    pub skew_y: f64,
    #[serde(default)]
    pub t_center_x: f64,
    #[serde(default)]
    pub t_center_y: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl Default for Transformation {
    fn default() -> Self {
        Transformation {
            translate_x: 0.0,
            translate_y: 0.0,
            rotation: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            skew_x: 0.0,
            skew_y: 0.0,
            t_center_x: 0.0,
            t_center_y: 0.0,
        }
    }
}

impl Transformation {
    pub fn is_identity(&self) -> bool {
        *self == Transformation::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn glyph_with_components(name: &str, components: &[&str]) -> VariableGlyph {
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
                    x_advance: Some(500.0),
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

    #[test]
    fn component_names_cover_all_layers() {
        let mut glyph = glyph_with_components("Aacute", &["A"]);
        glyph.layers.insert(
            "bold".to_string(),
            Layer {
                glyph: StaticGlyph {
                    components: vec![Component {
                        name: "acutecomb".to_string(),
                        ..Component::default()
                    }],
                    ..StaticGlyph::default()
                },
            },
        );
        let names: Vec<&str> = glyph.component_names().collect();
        assert_eq!(names, vec!["acutecomb", "A"]);
    }

    #[test]
    fn wire_names_are_camel_case() {
        let glyph = glyph_with_components("Aacute", &["A"]);
        let wire = serde_json::to_value(&glyph).unwrap();
        assert_eq!(
            wire["layers"]["default"]["glyph"]["xAdvance"],
            json!(500.0)
        );
        assert_eq!(
            wire["layers"]["default"]["glyph"]["components"][0]["name"],
            json!("A")
        );
        let back: VariableGlyph = serde_json::from_value(wire).unwrap();
        assert_eq!(back, glyph);
    }

    #[test]
    fn transformation_defaults_to_identity() {
        let component: Component = serde_json::from_value(json!({"name": "A"})).unwrap();
        assert!(component.transformation.is_identity());
        assert_eq!(component.transformation.scale_x, 1.0);
    }
}
