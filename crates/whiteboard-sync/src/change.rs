/// Change detection between local snapshots
/// Decides which elements need a version bump before they are broadcast
use std::collections::{HashMap, HashSet};

use crate::{ensure_versioning, increment_version, mark_as_deleted, Element};

/// Ids that are new, changed or removed in `current` relative to `previous`.
///
/// Payloads are compared with `version` and `versionNonce` ignored.
pub fn detect_modified_elements(current: &[Element], previous: &[Element]) -> HashSet<String> {
    let previous_by_id: HashMap<&str, &Element> =
        previous.iter().map(|e| (e.id.as_str(), e)).collect();
    let current_ids: HashSet<&str> = current.iter().map(|e| e.id.as_str()).collect();

    let mut modified = HashSet::new();

    for element in current {
        match previous_by_id.get(element.id.as_str()) {
            Some(old) if old.same_content(element) => {}
            _ => {
                modified.insert(element.id.clone());
            }
        }
    }

    for element in previous {
        if !current_ids.contains(element.id.as_str()) {
            modified.insert(element.id.clone());
        }
    }

    modified
}

/// Bump every modified element once and default the versioning of the rest.
///
/// Returns the full list; callers decide what subset goes on the wire.
pub fn prepare_elements_for_broadcast(
    elements: &[Element],
    modified: &HashSet<String>,
) -> Vec<Element> {
    elements
        .iter()
        .map(|element| {
            if modified.contains(&element.id) {
                increment_version(element.clone())
            } else {
                ensure_versioning(element.clone())
            }
        })
        .collect()
}

/// Tombstones for elements that disappeared from `current` without being
/// marked deleted, so their removal can win a merge on other replicas.
pub fn tombstones_for_removed(previous: &[Element], current: &[Element]) -> Vec<Element> {
    let current_ids: HashSet<&str> = current.iter().map(|e| e.id.as_str()).collect();

    previous
        .iter()
        .filter(|element| !current_ids.contains(element.id.as_str()))
        .map(|element| {
            if element.is_deleted() {
                ensure_versioning(element.clone())
            } else {
                mark_as_deleted(element.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(id: &str, x: i64) -> Element {
        Element::new(id).with_attribute("x", x)
    }

    #[test]
    fn test_unchanged_elements() {
        let modified = detect_modified_elements(&[el("a", 1)], &[el("a", 1)]);
        assert!(modified.is_empty());
    }

    #[test]
    fn test_changed_element() {
        let modified = detect_modified_elements(&[el("a", 2)], &[el("a", 1)]);
        assert_eq!(modified, HashSet::from(["a".to_string()]));
    }

    #[test]
    fn test_version_only_change_is_ignored() {
        let previous = el("a", 1).with_version(1, 1);
        let current = el("a", 1).with_version(5, 9);
        assert!(detect_modified_elements(&[current], &[previous]).is_empty());
    }

    #[test]
    fn test_new_removed_and_deleted() {
        let previous = vec![el("kept", 1), el("gone", 1), el("trashed", 1)];
        let current = vec![
            el("kept", 1),
            el("trashed", 1).with_deleted(true),
            el("fresh", 1),
        ];

        let modified = detect_modified_elements(&current, &previous);
        assert_eq!(
            modified,
            HashSet::from(["gone".to_string(), "trashed".to_string(), "fresh".to_string()])
        );
    }

    #[test]
    fn test_prepare_bumps_only_modified() {
        let elements = vec![
            el("a", 1).with_version(3, 1),
            Element::unversioned("b").with_attribute("x", 2),
        ];
        let modified = HashSet::from(["a".to_string()]);

        let prepared = prepare_elements_for_broadcast(&elements, &modified);
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].version(), 4);
        assert_eq!(prepared[1].version(), 1);
        assert!(prepared[1].is_versioned());
    }

    #[test]
    fn test_tombstones_for_removed() {
        let previous = vec![el("a", 1).with_version(2, 1), el("b", 1)];
        let current = vec![el("b", 1)];

        let tombstones = tombstones_for_removed(&previous, &current);
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].id, "a");
        assert!(tombstones[0].is_deleted());
        assert_eq!(tombstones[0].version(), 3);
    }

    #[test]
    fn test_prepare_with_maximal_peer_version() {
        let from_peer: Element = serde_json::from_str(
            r#"{"id":"e1","version":18446744073709551615,"versionNonce":7,"isDeleted":false,"x":1}"#,
        )
        .unwrap();
        let modified = HashSet::from(["e1".to_string()]);

        let prepared = prepare_elements_for_broadcast(&[from_peer.clone()], &modified);
        assert_eq!(prepared[0].version(), u64::MAX);

        let tombstones = tombstones_for_removed(&[from_peer], &[]);
        assert!(tombstones[0].is_deleted());
        assert_eq!(tombstones[0].version(), u64::MAX);
    }
}
