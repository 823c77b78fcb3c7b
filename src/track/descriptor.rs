use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::audio::filters::Filters;

/// What the control plane hands us to play. Immutable once queued; filters,
/// gain and stop state live on the [`Track`](super::Track) built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDescriptor {
    pub locator: String,
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// `None` for live streams or when the length is unknown.
    #[serde(rename = "durationSeconds", default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub subtitles_by_language: HashMap<String, String>,
    #[serde(rename = "startPositionSeconds", default)]
    pub start_position: f64,
    #[serde(rename = "contextMap", default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Filters::is_all_none")]
    pub filters: Filters,
}

impl TrackDescriptor {
    pub fn new(locator: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            id: id.into(),
            title: String::new(),
            duration: None,
            is_live: false,
            subtitles_by_language: HashMap::new(),
            start_position: 0.0,
            context: HashMap::new(),
            filters: Filters::default(),
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn live(mut self) -> Self {
        self.is_live = true;
        self.duration = None;
        self
    }

    pub fn is_seekable(&self) -> bool {
        !self.is_live && self.duration.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inbound_shape() {
        let json = r#"{
            "locator": "https://cdn.example/a.mp3",
            "id": "a",
            "title": "A",
            "durationSeconds": null,
            "isLive": true,
            "subtitlesByLanguage": {"en": "https://cdn.example/a.vtt"},
            "startPositionSeconds": 12.5,
            "contextMap": {"requester": 42}
        }"#;
        let d: TrackDescriptor = serde_json::from_str(json).unwrap();
        assert!(d.is_live);
        assert_eq!(d.duration, None);
        assert_eq!(d.start_position, 12.5);
        assert_eq!(d.context["requester"], 42);
        assert!(!d.is_seekable());
    }

    #[test]
    fn serializes_wire_names() {
        let d = TrackDescriptor::new("file.ogg", "x").with_duration(120.0);
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["durationSeconds"], 120.0);
        assert_eq!(v["startPositionSeconds"], 0.0);
        assert!(v.get("filters").is_none());
    }
}
