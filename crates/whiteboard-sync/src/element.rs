/// Versioned drawing elements
/// Every edit bumps `version` and redraws `versionNonce`; deletion is a tombstone
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Version assigned to a freshly created element
pub const INITIAL_VERSION: u64 = 1;

/// A single drawable primitive in the shared scene.
///
/// Geometry and style live in `attributes` and are merged as one opaque blob.
/// The versioning fields are optional on the wire because elements drawn
/// locally before the first sync may not carry them yet; see
/// [`ensure_versioning`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    /// Stable identity across replicas, never reused
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,

    /// Tie-breaker for equal versions, redrawn on every bump
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_nonce: Option<u32>,

    /// Tombstone flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,

    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Element {
    /// Create a new element at the initial version.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: Some(INITIAL_VERSION),
            version_nonce: Some(random_nonce()),
            is_deleted: Some(false),
            attributes: Map::new(),
        }
    }

    /// Element without any version metadata, as produced by a source that
    /// does not know the versioning scheme.
    pub fn unversioned(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            version_nonce: None,
            is_deleted: None,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: u64, nonce: u32) -> Self {
        self.version = Some(version);
        self.version_nonce = Some(nonce);
        self
    }

    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.is_deleted = Some(deleted);
        self
    }

    pub fn version(&self) -> u64 {
        self.version.unwrap_or(INITIAL_VERSION)
    }

    pub fn version_nonce(&self) -> u32 {
        self.version_nonce.unwrap_or(0)
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted.unwrap_or(false)
    }

    /// True when all three versioning fields are present.
    pub fn is_versioned(&self) -> bool {
        self.version.is_some() && self.version_nonce.is_some() && self.is_deleted.is_some()
    }

    /// Compare everything except `version` and `versionNonce`.
    pub fn same_content(&self, other: &Element) -> bool {
        self.id == other.id
            && self.is_deleted() == other.is_deleted()
            && self.attributes == other.attributes
    }
}

fn random_nonce() -> u32 {
    rand::random::<u32>()
}

/// Nonce for an element that arrived without one. Derived from the content so
/// every replica defaults the same element to the same value.
fn content_nonce(element: &Element) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(element.id.as_bytes());
    hasher.update(element.version().to_be_bytes());
    hasher.update([u8::from(element.is_deleted())]);
    hasher.update(serde_json::to_vec(&element.attributes).unwrap_or_default());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Fill any missing versioning field with its default.
///
/// Already-versioned elements are returned unchanged. A missing nonce is
/// derived from the element's content, so defaulting is deterministic.
pub fn ensure_versioning(element: Element) -> Element {
    if element.is_versioned() {
        return element;
    }

    let nonce = element
        .version_nonce
        .unwrap_or_else(|| content_nonce(&element));
    Element {
        version: Some(element.version.unwrap_or(INITIAL_VERSION)),
        version_nonce: Some(nonce),
        is_deleted: Some(element.is_deleted.unwrap_or(false)),
        ..element
    }
}

/// Copy with `version + 1` and a freshly drawn nonce. Call once per logical edit.
///
/// Saturates at `u64::MAX`; versions come from peers and are not trusted.
pub fn increment_version(element: Element) -> Element {
    let element = ensure_versioning(element);
    Element {
        version: Some(element.version().saturating_add(1)),
        version_nonce: Some(random_nonce()),
        ..element
    }
}

/// Increment the version and set the tombstone.
pub fn mark_as_deleted(element: Element) -> Element {
    Element {
        is_deleted: Some(true),
        ..increment_version(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ensure_versioning_fills_defaults() {
        let raw = Element::unversioned("e1");
        let versioned = ensure_versioning(raw);

        assert_eq!(versioned.version, Some(1));
        assert!(versioned.version_nonce.is_some());
        assert_eq!(versioned.is_deleted, Some(false));
    }

    #[test]
    fn test_ensure_versioning_idempotent() {
        let once = ensure_versioning(Element::unversioned("e1"));
        let twice = ensure_versioning(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_ensure_versioning_is_deterministic() {
        let raw = Element::unversioned("e1").with_attribute("x", 3);
        assert_eq!(ensure_versioning(raw.clone()), ensure_versioning(raw));

        let other = Element::unversioned("e1").with_attribute("x", 4);
        assert_ne!(
            ensure_versioning(other).version_nonce,
            ensure_versioning(Element::unversioned("e1").with_attribute("x", 3)).version_nonce
        );
    }

    #[test]
    fn test_increment_version_saturates() {
        let element: Element =
            serde_json::from_value(json!({"id": "e1", "version": u64::MAX, "versionNonce": 1}))
                .unwrap();

        let bumped = increment_version(element.clone());
        assert_eq!(bumped.version(), u64::MAX);

        let deleted = mark_as_deleted(element);
        assert_eq!(deleted.version(), u64::MAX);
        assert!(deleted.is_deleted());
    }

    #[test]
    fn test_ensure_versioning_keeps_present_fields() {
        let mut partial = Element::unversioned("e1");
        partial.version = Some(7);

        let versioned = ensure_versioning(partial);
        assert_eq!(versioned.version, Some(7));
        assert_eq!(versioned.is_deleted, Some(false));
    }

    #[test]
    fn test_increment_version() {
        let element = Element::new("e1").with_version(3, 42);
        let bumped = increment_version(element.clone());

        assert_eq!(bumped.version(), 4);
        assert_eq!(bumped.attributes, element.attributes);
        assert!(!bumped.is_deleted());
    }

    #[test]
    fn test_mark_as_deleted() {
        let element = Element::new("e1").with_attribute("x", 10);
        let deleted = mark_as_deleted(element);

        assert_eq!(deleted.version(), 2);
        assert!(deleted.is_deleted());
        assert_eq!(deleted.attributes.get("x"), Some(&json!(10)));
    }

    #[test]
    fn test_wire_format_is_camel_case_and_flat() {
        let element = Element::new("e1")
            .with_version(2, 99)
            .with_attribute("type", "rectangle")
            .with_attribute("x", 1.5);

        let value = serde_json::to_value(&element).unwrap();
        assert_eq!(value["id"], "e1");
        assert_eq!(value["version"], 2);
        assert_eq!(value["versionNonce"], 99);
        assert_eq!(value["isDeleted"], false);
        assert_eq!(value["type"], "rectangle");
        assert_eq!(value["x"], 1.5);
    }

    #[test]
    fn test_decode_unversioned_element() {
        let element: Element =
            serde_json::from_value(json!({"id": "raw", "type": "ellipse", "x": 3})).unwrap();

        assert!(!element.is_versioned());
        assert_eq!(element.version(), 1);
        assert!(!element.is_deleted());
        assert_eq!(element.attributes.get("type"), Some(&json!("ellipse")));
    }

    #[test]
    fn test_same_content_ignores_version() {
        let a = Element::new("a").with_attribute("x", 1).with_version(1, 5);
        let b = Element::new("a").with_attribute("x", 1).with_version(9, 6);
        let c = Element::new("a").with_attribute("x", 2).with_version(1, 5);

        assert!(a.same_content(&b));
        assert!(!a.same_content(&c));
        assert!(!a.same_content(&a.clone().with_deleted(true)));
    }
}
