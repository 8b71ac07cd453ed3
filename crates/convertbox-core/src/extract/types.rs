use std::collections::BTreeMap;

use serde::{Serialize, Serializer};

use super::hash::HashTriple;

pub const UNKNOWN_MIME: &str = "application/octet-stream";
pub const UNKNOWN_DESCRIPTION: &str = "Unknown file type";

/// What the sniffer decided a file is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeInfo {
    pub mime: String,
    pub description: String,
    /// Canonical extension for the detected type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl TypeInfo {
    pub fn new(mime: impl Into<String>, description: impl Into<String>, extension: Option<&str>) -> Self {
        Self {
            mime: mime.into(),
            description: description.into(),
            extension: extension.map(str::to_string),
        }
    }

    /// Fallback when nothing matched or detection failed.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_MIME, UNKNOWN_DESCRIPTION, None)
    }

    pub fn is_unknown(&self) -> bool {
        self.mime == UNKNOWN_MIME
    }
}

/// A single metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Null,
    /// The key is not present in the metadata
    Missing,
}

impl TagValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, TagValue::Missing)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => TagValue::Null,
            Value::Bool(b) => TagValue::Bool(*b),
            Value::Number(n) => n.as_f64().map(TagValue::Number).unwrap_or(TagValue::Null),
            Value::String(s) => TagValue::Text(s.clone()),
            Value::Array(items) => {
                let scalars: Option<Vec<String>> = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        Value::Bool(b) => Some(b.to_string()),
                        _ => None,
                    })
                    .collect();
                match scalars {
                    Some(parts) => TagValue::Text(parts.join(", ")),
                    None => TagValue::Text(value.to_string()),
                }
            }
            // Nested objects are flattened by TagMap
            Value::Object(_) => TagValue::Text(value.to_string()),
        }
    }
}

impl Serialize for TagValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TagValue::Text(s) => serializer.serialize_str(s),
            TagValue::Number(n) => serializer.serialize_f64(*n),
            TagValue::Bool(b) => serializer.serialize_bool(*b),
            TagValue::Null | TagValue::Missing => serializer.serialize_none(),
        }
    }
}

static MISSING: TagValue = TagValue::Missing;

/// Key → value metadata, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TagMap(BTreeMap<String, TagValue>);

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the metadata engine's JSON output.
    ///
    /// Nested objects become `Group:Key` entries. Anything but an object
    /// yields an empty map.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut map = Self::new();
        if let serde_json::Value::Object(fields) = value {
            map.flatten_into(None, fields);
        }
        map
    }

    fn flatten_into(&mut self, group: Option<&str>, fields: &serde_json::Map<String, serde_json::Value>) {
        for (key, value) in fields {
            let key = match group {
                Some(group) => format!("{}:{}", group, key),
                None => key.clone(),
            };
            match value {
                serde_json::Value::Object(inner) => self.flatten_into(Some(&key), inner),
                other => {
                    self.0.insert(key, TagValue::from_json(other));
                }
            }
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: TagValue) {
        self.0.insert(key.into(), value);
    }

    /// The value under `key`, or [`TagValue::Missing`].
    pub fn get(&self, key: &str) -> &TagValue {
        self.0.get(key).unwrap_or(&MISSING)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TagValue)> {
        self.0.iter()
    }
}

/// Independent progress of one extraction step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum StepState<T> {
    NotComputed,
    Loading,
    Ready(T),
}

impl<T> Default for StepState<T> {
    fn default() -> Self {
        StepState::NotComputed
    }
}

impl<T> StepState<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, StepState::Loading)
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            StepState::Ready(value) => Some(value),
            _ => None,
        }
    }
}

/// Derived data for one selected file as the session currently knows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionState {
    pub type_info: StepState<TypeInfo>,
    pub tags: StepState<TagMap>,
    pub hashes: StepState<HashTriple>,
    /// Coarse hashing progress: 0.25 after the read, 1.0 when done
    pub hash_progress: f64,
}

impl ExtractionState {
    pub fn is_loading(&self) -> bool {
        self.type_info.is_loading() || self.tags.is_loading() || self.hashes.is_loading()
    }

    pub fn is_complete(&self) -> bool {
        self.type_info.ready().is_some() && self.tags.ready().is_some() && self.hashes.ready().is_some()
    }

    pub fn is_step_loading(&self, step: ExtractionStep) -> bool {
        match step {
            ExtractionStep::Type => self.type_info.is_loading(),
            ExtractionStep::Tags => self.tags.is_loading(),
            ExtractionStep::Hashes => self.hashes.is_loading(),
        }
    }

    pub(crate) fn set_loading(&mut self, step: ExtractionStep) {
        match step {
            ExtractionStep::Type => self.type_info = StepState::Loading,
            ExtractionStep::Tags => self.tags = StepState::Loading,
            ExtractionStep::Hashes => {
                self.hashes = StepState::Loading;
                self.hash_progress = 0.0;
            }
        }
    }

    pub(crate) fn set_not_computed(&mut self, step: ExtractionStep) {
        match step {
            ExtractionStep::Type => self.type_info = StepState::NotComputed,
            ExtractionStep::Tags => self.tags = StepState::NotComputed,
            ExtractionStep::Hashes => {
                self.hashes = StepState::NotComputed;
                self.hash_progress = 0.0;
            }
        }
    }
}

/// Complete result of running every extraction step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub type_info: TypeInfo,
    pub tags: TagMap,
    pub hashes: HashTriple,
}

/// One of the independent extraction steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStep {
    Type,
    Tags,
    Hashes,
}

impl ExtractionStep {
    pub const ALL: [ExtractionStep; 3] = [
        ExtractionStep::Type,
        ExtractionStep::Tags,
        ExtractionStep::Hashes,
    ];
}

impl std::fmt::Display for ExtractionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionStep::Type => write!(f, "type"),
            ExtractionStep::Tags => write!(f, "tags"),
            ExtractionStep::Hashes => write!(f, "hashes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_map_flattens_groups() {
        let tags = TagMap::from_json(&json!({
            "FileType": "PNG",
            "ImageWidth": 640,
            "Interlaced": false,
            "Comment": null,
            "Keywords": ["cat", "sofa"],
            "EXIF": { "Make": "Canon", "ISO": 200 }
        }));

        assert_eq!(tags.get("FileType"), &TagValue::Text("PNG".into()));
        assert_eq!(tags.get("ImageWidth").as_f64(), Some(640.0));
        assert_eq!(tags.get("Interlaced"), &TagValue::Bool(false));
        assert_eq!(tags.get("Comment"), &TagValue::Null);
        assert_eq!(tags.get("Keywords").as_str(), Some("cat, sofa"));
        assert_eq!(tags.get("EXIF:Make").as_str(), Some("Canon"));
        assert!(tags.get("GPSLatitude").is_missing());
        assert_eq!(tags.len(), 7);
    }

    #[test]
    fn test_non_object_metadata_is_empty() {
        assert!(TagMap::from_json(&json!("oops")).is_empty());
        assert!(TagMap::from_json(&json!([1, 2])).is_empty());
    }

    #[test]
    fn test_step_state_serialization() {
        let state: StepState<TypeInfo> = StepState::Ready(TypeInfo::unknown());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "ready");
        assert_eq!(json["value"]["mime"], "application/octet-stream");
        assert_eq!(json["value"]["description"], "Unknown file type");

        let json = serde_json::to_value(StepState::<TypeInfo>::Loading).unwrap();
        assert_eq!(json, json!({"state": "loading"}));
    }
}
