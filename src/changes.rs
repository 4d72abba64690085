// this_file: src/changes.rs

//! Edit descriptions and the operations the handler needs on them.
//!
//! A [`Change`] is the serializable unit of editing, wire-compatible with
//! the editor protocol: a path anchoring it in the font data tree, an
//! optional operation with arguments, and child changes applied at the same
//! anchor. Changes are applied to JSON trees ([`serde_json::Value`]); typed
//! values cross that boundary through serde.
//!
//! The path of a `=`/`d` operation effectively extends to the key it
//! assigns or deletes, so a root-level assignment of, say, `unitsPerEm`
//! collects and matches under `["unitsPerEm"]`.

use crate::error::{Error, Result};
use crate::pattern::{PathElement, Pattern};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation kinds, with their wire names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeFunc {
    /// Set a key on a mapping, or an index on a list: `args = [key, value]`
    #[serde(rename = "=")]
    Set,
    /// Delete a key from a mapping: `args = [key]`
    #[serde(rename = "d")]
    Delete,
    /// Insert items into a list: `args = [index, item...]`
    #[serde(rename = "+")]
    InsertItems,
    /// Delete items from a list: `args = [index, count?]` (count defaults to 1)
    #[serde(rename = "-")]
    DeleteItems,
    /// Splice a list: `args = [index, deleteCount, item...]`
    #[serde(rename = ":")]
    Splice,
}

/// One edit description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Anchor path, relative to the parent change (or the root).
    #[serde(rename = "p", default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathElement>,
    /// Operation at the anchor.
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub func: Option<ChangeFunc>,
    /// Operation arguments.
    #[serde(rename = "a", default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    /// Child changes, applied at the same anchor.
    #[serde(rename = "c", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Change>,
}

impl Change {
    /// A change setting `key` at `path` to `value`.
    pub fn set(path: Vec<PathElement>, key: impl Into<PathElement>, value: Value) -> Self {
        Change {
            path,
            func: Some(ChangeFunc::Set),
            args: vec![path_element_to_value(&key.into()), value],
            children: Vec::new(),
        }
    }

    /// A change deleting `key` at `path`.
    pub fn delete(path: Vec<PathElement>, key: impl Into<PathElement>) -> Self {
        Change {
            path,
            func: Some(ChangeFunc::Delete),
            args: vec![path_element_to_value(&key.into())],
            children: Vec::new(),
        }
    }

    /// A change grouping several child changes under the root.
    pub fn group(children: Vec<Change>) -> Self {
        Change {
            children,
            ..Change::default()
        }
    }

    /// True when the change carries neither an operation nor children.
    pub fn is_empty(&self) -> bool {
        self.func.is_none() && self.children.is_empty()
    }
}

/// Hooks invoked while a change is applied.
///
/// `parent` is the absolute path of the mapping the key lives in. The
/// handler uses this to track root assignments and glyph inserts/deletes.
pub trait ChangeObserver {
    /// A key was assigned on a mapping. `existed` tells whether the key was
    /// already present.
    fn key_assigned(&mut self, _parent: &[PathElement], _key: &str, _existed: bool) {}

    /// A key was deleted from a mapping (whether or not it was present).
    fn key_deleted(&mut self, _parent: &[PathElement], _key: &str) {}
}

struct NoopObserver;

impl ChangeObserver for NoopObserver {}

/// Apply `change` to a JSON tree.
pub fn apply_change(root: &mut Value, change: &Change) -> Result<()> {
    apply_change_observed(root, change, &mut NoopObserver)
}

/// Apply `change` to a JSON tree, reporting key assignments and deletions
/// to `observer`.
pub fn apply_change_observed(
    root: &mut Value,
    change: &Change,
    observer: &mut dyn ChangeObserver,
) -> Result<()> {
    let mut abs = Vec::new();
    apply_node(root, &mut abs, change, observer)
}

fn apply_node(
    node: &mut Value,
    abs: &mut Vec<PathElement>,
    change: &Change,
    observer: &mut dyn ChangeObserver,
) -> Result<()> {
    let depth = abs.len();
    let mut target = node;
    for element in &change.path {
        target = child_mut(target, element)?;
        abs.push(element.clone());
    }
    if let Some(func) = change.func {
        apply_func(target, abs, func, &change.args, observer)?;
    }
    for child in &change.children {
        apply_node(target, abs, child, observer)?;
    }
    abs.truncate(depth);
    Ok(())
}

fn child_mut<'a>(node: &'a mut Value, element: &PathElement) -> Result<&'a mut Value> {
    match (node, element) {
        (Value::Object(map), PathElement::Key(key)) => map
            .get_mut(key)
            .ok_or_else(|| Error::Change(format!("no such key: {}", key))),
        (Value::Array(items), PathElement::Index(index)) => {
            let index = *index as usize;
            items
                .get_mut(index)
                .ok_or_else(|| Error::Change(format!("index {} out of range", index)))
        }
        (_, element) => Err(Error::Change(format!(
            "cannot descend into {} here",
            element
        ))),
    }
}

fn apply_func(
    target: &mut Value,
    abs: &[PathElement],
    func: ChangeFunc,
    args: &[Value],
    observer: &mut dyn ChangeObserver,
) -> Result<()> {
    match func {
        ChangeFunc::Set => {
            let (key, value) = two_args(args)?;
            match (target, &key) {
                (Value::Object(map), PathElement::Key(name)) => {
                    let existed = map.contains_key(name);
                    map.insert(name.clone(), value.clone());
                    observer.key_assigned(abs, name, existed);
                }
                (Value::Array(items), PathElement::Index(index)) => {
                    let index = *index as usize;
                    let slot = items.get_mut(index).ok_or_else(|| {
                        Error::Change(format!("index {} out of range", index))
                    })?;
                    *slot = value.clone();
                }
                _ => return Err(Error::Change("set target mismatch".to_string())),
            }
        }
        ChangeFunc::Delete => {
            let key = one_arg(args)?;
            match (target, &key) {
                (Value::Object(map), PathElement::Key(name)) => {
                    map.remove(name);
                    observer.key_deleted(abs, name);
                }
                _ => return Err(Error::Change("delete target mismatch".to_string())),
            }
        }
        ChangeFunc::InsertItems => {
            let items = list_target(target)?;
            let index = index_arg(args, 0)?;
            if index > items.len() {
                return Err(Error::Change(format!("index {} out of range", index)));
            }
            for (offset, item) in args[1..].iter().enumerate() {
                items.insert(index + offset, item.clone());
            }
        }
        ChangeFunc::DeleteItems => {
            let items = list_target(target)?;
            let index = index_arg(args, 0)?;
            let count = if args.len() > 1 { index_arg(args, 1)? } else { 1 };
            if index + count > items.len() {
                return Err(Error::Change(format!("range {}..{} out of range", index, index + count)));
            }
            items.drain(index..index + count);
        }
        ChangeFunc::Splice => {
            let items = list_target(target)?;
            let index = index_arg(args, 0)?;
            let count = index_arg(args, 1)?;
            if index + count > items.len() {
                return Err(Error::Change(format!("range {}..{} out of range", index, index + count)));
            }
            items.splice(index..index + count, args[2..].iter().cloned());
        }
    }
    Ok(())
}

fn one_arg(args: &[Value]) -> Result<PathElement> {
    let key = args
        .first()
        .ok_or_else(|| Error::Change("missing key argument".to_string()))?;
    value_to_path_element(key)
}

fn two_args(args: &[Value]) -> Result<(PathElement, &Value)> {
    if args.len() < 2 {
        return Err(Error::Change("missing value argument".to_string()));
    }
    Ok((value_to_path_element(&args[0])?, &args[1]))
}

fn index_arg(args: &[Value], position: usize) -> Result<usize> {
    args.get(position)
        .and_then(Value::as_u64)
        .map(|i| i as usize)
        .ok_or_else(|| Error::Change("expected an index argument".to_string()))
}

fn list_target(target: &mut Value) -> Result<&mut Vec<Value>> {
    target
        .as_array_mut()
        .ok_or_else(|| Error::Change("expected a list target".to_string()))
}

fn value_to_path_element(value: &Value) -> Result<PathElement> {
    match value {
        Value::String(s) => Ok(PathElement::Key(s.clone())),
        Value::Number(n) => n
            .as_u64()
            .map(PathElement::Index)
            .ok_or_else(|| Error::Change(format!("bad index: {}", n))),
        other => Err(Error::Change(format!("bad key argument: {}", other))),
    }
}

fn path_element_to_value(element: &PathElement) -> Value {
    match element {
        PathElement::Key(k) => Value::String(k.clone()),
        PathElement::Index(i) => Value::Number((*i).into()),
    }
}

/// Visit the effective path of every operation in `change`.
///
/// The effective path of `=`/`d` is the anchor path extended with the key
/// argument; list operations affect the anchor path itself.
fn visit_effective_paths(
    change: &Change,
    prefix: &mut Vec<PathElement>,
    visit: &mut dyn FnMut(&[PathElement]),
) {
    let depth = prefix.len();
    prefix.extend(change.path.iter().cloned());
    if let Some(func) = change.func {
        match func {
            ChangeFunc::Set | ChangeFunc::Delete => {
                if let Some(Ok(key)) = change.args.first().map(value_to_path_element) {
                    prefix.push(key);
                    visit(prefix);
                    prefix.pop();
                }
            }
            ChangeFunc::InsertItems | ChangeFunc::DeleteItems | ChangeFunc::Splice => {
                visit(prefix);
            }
        }
    }
    for child in &change.children {
        visit_effective_paths(child, prefix, visit);
    }
    prefix.truncate(depth);
}

/// Collect the sorted, deduplicated depth-`depth` prefixes of all paths the
/// change affects. Paths shorter than `depth` do not contribute.
pub fn collect_change_paths(change: &Change, depth: usize) -> Vec<Vec<PathElement>> {
    let mut paths = Vec::new();
    let mut prefix = Vec::new();
    visit_effective_paths(change, &mut prefix, &mut |path| {
        if path.len() >= depth {
            paths.push(path[..depth].to_vec());
        }
    });
    paths.sort();
    paths.dedup();
    paths
}

/// True when the change affects any path selected by `pattern`.
pub fn match_change_pattern(change: &Change, pattern: &Pattern) -> bool {
    let mut matched = false;
    let mut prefix = Vec::new();
    visit_effective_paths(change, &mut prefix, &mut |path| {
        matched = matched || pattern.contains_path(path);
    });
    matched
}

/// Restrict `change` to the parts selected by `pattern`.
///
/// Returns `None` when nothing of the change survives.
pub fn filter_change_pattern(change: &Change, pattern: &Pattern) -> Option<Change> {
    filter_node(change, Cursor::Node(pattern))
}

#[derive(Clone, Copy)]
enum Cursor<'a> {
    /// Still inside the pattern tree.
    Node(&'a Pattern),
    /// Below a sentinel: everything from here on is selected.
    Matched,
}

fn filter_node(change: &Change, cursor: Cursor<'_>) -> Option<Change> {
    let mut cursor = cursor;
    for element in &change.path {
        cursor = match cursor {
            Cursor::Matched => Cursor::Matched,
            Cursor::Node(pattern) => match pattern.get(&element.pattern_key()) {
                None => return None,
                Some(None) => Cursor::Matched,
                Some(Some(sub)) => {
                    if sub.is_empty() {
                        Cursor::Matched
                    } else {
                        Cursor::Node(sub)
                    }
                }
            },
        };
    }
    match cursor {
        Cursor::Matched => Some(change.clone()),
        Cursor::Node(pattern) => {
            let keep_func = match change.func {
                Some(ChangeFunc::Set) | Some(ChangeFunc::Delete) => change
                    .args
                    .first()
                    .and_then(|key| value_to_path_element(key).ok())
                    .map(|key| pattern.contains_path(std::slice::from_ref(&key)))
                    .unwrap_or(false),
                _ => false,
            };
            let children: Vec<Change> = change
                .children
                .iter()
                .filter_map(|child| filter_node(child, Cursor::Node(pattern)))
                .collect();
            if !keep_func && children.is_empty() {
                return None;
            }
            Some(Change {
                path: change.path.clone(),
                func: if keep_func { change.func } else { None },
                args: if keep_func { change.args.clone() } else { Vec::new() },
                children,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn glyphs_path() -> Vec<PathElement> {
        vec!["glyphs".into()]
    }

    #[test]
    fn wire_round_trip() {
        let change = Change::set(glyphs_path(), "A", json!({"name": "A"}));
        let wire = serde_json::to_value(&change).unwrap();
        assert_eq!(wire, json!({"p": ["glyphs"], "f": "=", "a": ["A", {"name": "A"}]}));
        let back: Change = serde_json::from_value(wire).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn apply_set_and_delete_on_mappings() {
        let mut root = json!({"glyphs": {"A": 1}});
        apply_change(&mut root, &Change::set(glyphs_path(), "B", json!(2))).unwrap();
        apply_change(&mut root, &Change::delete(glyphs_path(), "A")).unwrap();
        assert_eq!(root, json!({"glyphs": {"B": 2}}));
    }

    #[test]
    fn apply_list_operations() {
        let mut root = json!({"axes": [1, 2, 3]});
        let insert = Change {
            path: vec!["axes".into()],
            func: Some(ChangeFunc::InsertItems),
            args: vec![json!(1), json!(9), json!(8)],
            children: Vec::new(),
        };
        apply_change(&mut root, &insert).unwrap();
        assert_eq!(root, json!({"axes": [1, 9, 8, 2, 3]}));

        let splice = Change {
            path: vec!["axes".into()],
            func: Some(ChangeFunc::Splice),
            args: vec![json!(0), json!(2), json!(7)],
            children: Vec::new(),
        };
        apply_change(&mut root, &splice).unwrap();
        assert_eq!(root, json!({"axes": [7, 8, 2, 3]}));

        let remove = Change {
            path: vec!["axes".into()],
            func: Some(ChangeFunc::DeleteItems),
            args: vec![json!(1)],
            children: Vec::new(),
        };
        apply_change(&mut root, &remove).unwrap();
        assert_eq!(root, json!({"axes": [7, 2, 3]}));
    }

    #[test]
    fn apply_reports_missing_path() {
        let mut root = json!({"glyphs": {}});
        let change = Change::set(vec!["glyphs".into(), "A".into()], "name", json!("A"));
        assert!(apply_change(&mut root, &change).is_err());
        assert_eq!(root, json!({"glyphs": {}}));
    }

    #[test]
    fn observer_sees_assignments_and_deletions() {
        #[derive(Default)]
        struct Recorder {
            assigned: Vec<(Vec<PathElement>, String, bool)>,
            deleted: Vec<(Vec<PathElement>, String)>,
        }
        impl ChangeObserver for Recorder {
            fn key_assigned(&mut self, parent: &[PathElement], key: &str, existed: bool) {
                self.assigned.push((parent.to_vec(), key.to_string(), existed));
            }
            fn key_deleted(&mut self, parent: &[PathElement], key: &str) {
                self.deleted.push((parent.to_vec(), key.to_string()));
            }
        }

        let mut root = json!({"glyphs": {"A": 1}, "unitsPerEm": 1000});
        let change = Change::group(vec![
            Change::set(glyphs_path(), "A", json!(2)),
            Change::set(glyphs_path(), "B", json!(3)),
            Change::delete(glyphs_path(), "A"),
            Change::set(Vec::new(), "unitsPerEm", json!(2048)),
        ]);
        let mut recorder = Recorder::default();
        apply_change_observed(&mut root, &change, &mut recorder).unwrap();

        assert_eq!(
            recorder.assigned,
            vec![
                (glyphs_path(), "A".to_string(), true),
                (glyphs_path(), "B".to_string(), false),
                (Vec::new(), "unitsPerEm".to_string(), false),
            ]
        );
        assert_eq!(recorder.deleted, vec![(glyphs_path(), "A".to_string())]);
        assert_eq!(root["unitsPerEm"], json!(2048));
    }

    #[test]
    fn collect_paths_sees_assignment_keys() {
        let change = Change::group(vec![
            Change::set(Vec::new(), "unitsPerEm", json!(1000)),
            Change::set(glyphs_path(), "B", json!(1)),
            Change::set(vec!["glyphs".into(), "A".into()], "name", json!("A")),
        ]);
        let expected_roots: Vec<Vec<PathElement>> =
            vec![vec!["glyphs".into()], vec!["unitsPerEm".into()]];
        assert_eq!(collect_change_paths(&change, 1), expected_roots);

        let expected_glyph_paths: Vec<Vec<PathElement>> = vec![
            vec!["glyphs".into(), "A".into()],
            vec!["glyphs".into(), "B".into()],
        ];
        assert_eq!(collect_change_paths(&change, 2), expected_glyph_paths);
    }

    #[test]
    fn match_respects_pattern_depth() {
        let pattern = Pattern::from_path(&["glyphs".into(), "A".into()]);
        let touches_a = Change::set(vec!["glyphs".into(), "A".into()], "name", json!("A"));
        let touches_b = Change::set(vec!["glyphs".into(), "B".into()], "name", json!("B"));
        let replaces_map = Change::set(Vec::new(), "glyphs", json!({}));
        assert!(match_change_pattern(&touches_a, &pattern));
        assert!(!match_change_pattern(&touches_b, &pattern));
        assert!(!match_change_pattern(&replaces_map, &pattern));

        let root_pattern = Pattern::from_path(&["unitsPerEm".into()]);
        let set_upm = Change::set(Vec::new(), "unitsPerEm", json!(1000));
        assert!(match_change_pattern(&set_upm, &root_pattern));
    }

    #[test]
    fn filter_keeps_only_selected_parts() {
        let change = Change::group(vec![
            Change::set(glyphs_path(), "A", json!(1)),
            Change::set(glyphs_path(), "B", json!(2)),
            Change::set(Vec::new(), "unitsPerEm", json!(1000)),
        ]);
        let pattern = Pattern::from_path(&["glyphs".into(), "A".into()]);
        let filtered = filter_change_pattern(&change, &pattern).unwrap();
        assert_eq!(filtered.children.len(), 1);
        assert_eq!(filtered.children[0], Change::set(glyphs_path(), "A", json!(1)));

        let unrelated = Pattern::from_path(&["axes".into()]);
        assert!(filter_change_pattern(&change, &unrelated).is_none());
    }

    #[test]
    fn filter_passes_whole_subtree_under_sentinel() {
        let change = Change::set(vec!["glyphs".into(), "A".into()], "name", json!("A2"));
        let pattern = Pattern::from_path(&["glyphs".into(), "A".into()]);
        assert_eq!(filter_change_pattern(&change, &pattern), Some(change));
    }
}
