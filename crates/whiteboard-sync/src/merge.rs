/// Last-writer-wins reconciliation of element collections and scenes
/// Merging is commutative, associative and idempotent so replicas converge
/// regardless of delivery order or duplication
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::{ensure_versioning, Element};

/// File blobs keyed by content-derived id
pub type BinaryFiles = BTreeMap<String, Value>;

/// Viewport zoom factor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Zoom {
    pub value: f64,
}

impl Default for Zoom {
    fn default() -> Self {
        Self { value: 1.0 }
    }
}

/// Per-user frame rendering toggles
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRendering {
    pub enabled: bool,
    pub name: bool,
    pub outline: bool,
    pub clip: bool,
}

impl Default for FrameRendering {
    fn default() -> Self {
        Self {
            enabled: true,
            name: true,
            outline: true,
            clip: true,
        }
    }
}

/// Shared view state of a room.
///
/// The `current_item_*` drawing defaults converge across collaborators. The
/// viewport fields are personal and never taken from a peer; see
/// [`merge_app_state`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    // Viewport, local only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<Zoom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rendering: Option<FrameRendering>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_background_color: Option<String>,

    // Shared drawing defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item_stroke_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item_background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item_fill_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item_stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item_roughness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item_opacity: Option<f64>,

    /// Any other field the editor sends along; carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppState {
    /// The state worth sending to peers: everything except the viewport.
    pub fn shared_slice(&self) -> AppState {
        AppState {
            scroll_x: None,
            scroll_y: None,
            zoom: None,
            grid_size: None,
            frame_rendering: None,
            view_background_color: None,
            ..self.clone()
        }
    }
}

/// Full collaborative document of one room
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub app_state: AppState,
    #[serde(default)]
    pub files: BinaryFiles,
}

/// Total precedence order between two versioned copies of one element.
///
/// `Greater` means `a` is authoritative.
fn precedence(a: &Element, b: &Element) -> Ordering {
    a.version()
        .cmp(&b.version())
        // A tombstone beats a live copy of the same version
        .then_with(|| a.is_deleted().cmp(&b.is_deleted()))
        // Smaller nonce wins
        .then_with(|| b.version_nonce().cmp(&a.version_nonce()))
        .then_with(|| {
            if a == b {
                return Ordering::Equal;
            }
            // Same version and nonce but different payloads: fall back to the
            // canonical encoding so both argument orders pick the same value.
            let a_key = serde_json::to_string(a).unwrap_or_default();
            let b_key = serde_json::to_string(b).unwrap_or_default();
            b_key.cmp(&a_key)
        })
}

/// Pick the authoritative copy of an element.
///
/// Both inputs are defaulted with [`ensure_versioning`] first. The higher
/// `version` wins. On equal versions a tombstone wins over a live copy, then
/// the smaller `versionNonce` wins. The result does not depend on argument
/// order.
pub fn get_newer_element(a: &Element, b: &Element) -> Element {
    let a = ensure_versioning(a.clone());
    let b = ensure_versioning(b.clone());

    match precedence(&a, &b) {
        Ordering::Less => b,
        Ordering::Equal | Ordering::Greater => a,
    }
}

/// Index a list by id, preserving first-seen order and folding duplicate ids.
fn index_by_id<'a>(
    elements: &'a [Element],
    order: &mut Vec<&'a str>,
    winners: &mut HashMap<&'a str, Element>,
) {
    for element in elements {
        let id = element.id.as_str();
        let winner = match winners.get(id) {
            Some(existing) => get_newer_element(existing, element),
            None => {
                order.push(id);
                ensure_versioning(element.clone())
            }
        };
        winners.insert(id, winner);
    }
}

/// Union of two element collections, keeping the newer copy of shared ids.
///
/// Output order: local ids first, then remote-only ids, each in first-seen
/// order. Every output element is versioned. Tombstones are kept.
pub fn merge_elements(local: &[Element], remote: &[Element]) -> Vec<Element> {
    let mut order = Vec::with_capacity(local.len() + remote.len());
    let mut winners: HashMap<&str, Element> = HashMap::with_capacity(local.len() + remote.len());

    index_by_id(local, &mut order, &mut winners);
    index_by_id(remote, &mut order, &mut winners);

    order
        .into_iter()
        .filter_map(|id| winners.remove(id))
        .collect()
}

/// Drop tombstones. Only for rendering; never filter before re-broadcasting.
pub fn filter_deleted_elements(elements: &[Element]) -> Vec<Element> {
    elements
        .iter()
        .filter(|element| !element.is_deleted())
        .cloned()
        .collect()
}

/// Take the remote state, keeping the local viewport.
pub fn merge_app_state(local: &AppState, remote: &AppState) -> AppState {
    AppState {
        scroll_x: local.scroll_x,
        scroll_y: local.scroll_y,
        zoom: local.zoom,
        grid_size: local.grid_size,
        frame_rendering: local.frame_rendering,
        view_background_color: local.view_background_color.clone(),
        ..remote.clone()
    }
}

/// Merge a remote scene into the local one.
///
/// Files are a shallow union where the remote entry replaces a local entry
/// with the same key.
pub fn merge_scenes(local: &Scene, remote: &Scene) -> Scene {
    let mut files = local.files.clone();
    files.extend(remote.files.iter().map(|(k, v)| (k.clone(), v.clone())));

    Scene {
        elements: merge_elements(&local.elements, &remote.elements),
        app_state: merge_app_state(&local.app_state, &remote.app_state),
        files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn el(id: &str, version: u64, nonce: u32) -> Element {
        Element::new(id).with_version(version, nonce)
    }

    #[test]
    fn test_higher_version_wins() {
        let a = el("e1", 2, 10);
        let b = el("e1", 3, 10);
        assert_eq!(get_newer_element(&a, &b), b);
        assert_eq!(get_newer_element(&b, &a), b);
    }

    #[test]
    fn test_smaller_nonce_breaks_tie() {
        let local = el("e1", 3, 500);
        let remote = el("e1", 3, 200);
        assert_eq!(get_newer_element(&local, &remote), remote);
        assert_eq!(get_newer_element(&remote, &local), remote);
    }

    #[test]
    fn test_tombstone_wins_at_equal_version() {
        let deleted = el("e1", 3, 500).with_deleted(true);
        let live = el("e1", 3, 200);

        let merged = merge_elements(&[deleted.clone()], &[live.clone()]);
        assert_eq!(merged, vec![deleted.clone()]);
        assert!(filter_deleted_elements(&merged).is_empty());
        assert_eq!(merge_elements(&[live], &[deleted.clone()]), vec![deleted]);
    }

    #[test]
    fn test_full_tie_is_order_independent() {
        let x = el("e1", 4, 77).with_attribute("x", 1);
        let y = el("e1", 4, 77).with_attribute("x", 2);

        assert_eq!(get_newer_element(&x, &y), get_newer_element(&y, &x));
    }

    #[test]
    fn test_delete_wins_over_older_copy() {
        let local = el("e1", 1, 10);
        let remote = el("e1", 2, 10).with_deleted(true);

        let merged = merge_elements(&[local], &[remote]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_deleted());
        assert_eq!(merged[0].version(), 2);
        assert!(filter_deleted_elements(&merged).is_empty());
    }

    #[test]
    fn test_disjoint_elements_are_unioned() {
        let merged = merge_elements(&[el("a", 1, 1)], &[el("b", 1, 1)]);

        let ids: Vec<_> = merged.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_unversioned_element_loses_to_newer_remote() {
        let raw = Element::unversioned("e1").with_attribute("x", 1);
        let remote = el("e1", 2, 1).with_attribute("x", 2);

        let merged = merge_elements(&[raw], &[remote.clone()]);
        assert_eq!(merged, vec![remote]);
    }

    #[test]
    fn test_merge_output_is_versioned() {
        let raw = Element::unversioned("only-local").with_attribute("x", 1);

        let once = merge_elements(&[raw.clone()], &[]);
        assert!(once[0].is_versioned());
        assert_eq!(merge_elements(&once, &[raw]), once);
    }

    #[test]
    fn test_unversioned_element_against_version_one() {
        let raw = Element::unversioned("e1");
        let remote = el("e1", 1, u32::MAX);

        // The defaulted nonce can only tie or beat u32::MAX.
        let winner = get_newer_element(&raw, &remote);
        assert_eq!(winner.version(), 1);
        assert!(winner.is_versioned());
    }

    #[test]
    fn test_duplicate_ids_within_a_list_are_folded() {
        let merged = merge_elements(&[el("a", 1, 1), el("a", 5, 1)], &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].version(), 5);
    }

    #[test]
    fn test_no_cap_on_merge_size() {
        let local: Vec<_> = (0..3000).map(|i| el(&format!("l{i}"), 1, 1)).collect();
        let remote: Vec<_> = (0..3000).map(|i| el(&format!("r{i}"), 1, 1)).collect();

        assert_eq!(merge_elements(&local, &remote).len(), 6000);
    }

    #[test]
    fn test_merge_app_state_keeps_local_viewport() {
        let local = AppState {
            scroll_x: Some(10.0),
            scroll_y: Some(20.0),
            zoom: Some(Zoom { value: 2.0 }),
            grid_size: Some(20),
            frame_rendering: Some(FrameRendering::default()),
            view_background_color: Some("#ffffff".into()),
            current_item_stroke_color: Some("#000000".into()),
            ..AppState::default()
        };
        let remote = AppState {
            scroll_x: Some(-5.0),
            scroll_y: None,
            zoom: Some(Zoom { value: 0.5 }),
            grid_size: None,
            frame_rendering: Some(FrameRendering {
                enabled: false,
                name: false,
                outline: false,
                clip: false,
            }),
            view_background_color: Some("#123456".into()),
            current_item_stroke_color: Some("#ff0000".into()),
            current_item_opacity: Some(50.0),
            ..AppState::default()
        };

        let merged = merge_app_state(&local, &remote);
        assert_eq!(merged.scroll_x, Some(10.0));
        assert_eq!(merged.scroll_y, Some(20.0));
        assert_eq!(merged.zoom, Some(Zoom { value: 2.0 }));
        assert_eq!(merged.grid_size, Some(20));
        assert_eq!(merged.frame_rendering, Some(FrameRendering::default()));
        assert_eq!(merged.view_background_color.as_deref(), Some("#ffffff"));
        assert_eq!(merged.current_item_stroke_color.as_deref(), Some("#ff0000"));
        assert_eq!(merged.current_item_opacity, Some(50.0));
    }

    #[test]
    fn test_app_state_extra_fields_round_trip() {
        let state: AppState = serde_json::from_value(json!({
            "scrollX": 1.0,
            "currentItemStrokeColor": "#1e1e1e",
            "currentItemFontFamily": 1
        }))
        .unwrap();

        assert_eq!(state.scroll_x, Some(1.0));
        assert_eq!(state.current_item_stroke_color.as_deref(), Some("#1e1e1e"));
        assert_eq!(state.extra.get("currentItemFontFamily"), Some(&json!(1)));
    }

    #[test]
    fn test_shared_slice_has_no_viewport() {
        let state = AppState {
            scroll_x: Some(1.0),
            view_background_color: Some("#fff".into()),
            current_item_roughness: Some(1.0),
            ..AppState::default()
        };

        let slice = state.shared_slice();
        assert!(slice.scroll_x.is_none());
        assert!(slice.view_background_color.is_none());
        assert_eq!(slice.current_item_roughness, Some(1.0));
    }

    #[test]
    fn test_merge_scenes_files_remote_overwrites() {
        let mut local = Scene::default();
        local.files.insert("f1".into(), json!("local"));
        local.files.insert("f2".into(), json!("only-local"));

        let mut remote = Scene::default();
        remote.files.insert("f1".into(), json!("remote"));
        remote.files.insert("f3".into(), json!("only-remote"));

        let merged = merge_scenes(&local, &remote);
        assert_eq!(merged.files.len(), 3);
        assert_eq!(merged.files["f1"], json!("remote"));
        assert_eq!(merged.files["f2"], json!("only-local"));
        assert_eq!(merged.files["f3"], json!("only-remote"));
    }
}
