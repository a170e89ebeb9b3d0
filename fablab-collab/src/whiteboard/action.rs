//! Drawing actions: the immutable entries of the whiteboard log.
//!
//! Wire shape (inside a `whiteboard_action` payload):
//! ```text
//! {"id":"…", "type":"draw", "data":{"points":[{"x":1,"y":2}], "color":"#000", "width":2},
//!  "user_id":"…", "user_name":"…", "timestamp":"2024-05-01T12:00:00Z"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{timestamp, Identity};

pub const DEFAULT_COLOR: &str = "#000000";
pub const DEFAULT_STROKE_WIDTH: f64 = 2.0;
pub const DEFAULT_FONT_SIZE: f64 = 16.0;
pub const DEFAULT_NOTE_COLOR: &str = "#fef08a";
pub const DEFAULT_NOTE_WIDTH: f64 = 200.0;
pub const DEFAULT_NOTE_HEIGHT: f64 = 150.0;

fn default_color() -> String {
    DEFAULT_COLOR.to_string()
}

fn default_stroke_width() -> f64 {
    DEFAULT_STROKE_WIDTH
}

fn default_font_size() -> f64 {
    DEFAULT_FONT_SIZE
}

fn default_note_color() -> String {
    DEFAULT_NOTE_COLOR.to_string()
}

fn default_note_width() -> f64 {
    DEFAULT_NOTE_WIDTH
}

fn default_note_height() -> f64 {
    DEFAULT_NOTE_HEIGHT
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

/// Freehand path; used by both `draw` and `erase`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<Point>,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_stroke_width")]
    pub width: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    /// Axis-aligned box spanned by `start` and `end`.
    Rectangle,
    /// Centered on `start`, passing through `end`.
    Circle,
    Line,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub shape: ShapeKind,
    pub start: Point,
    pub end: Point,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_stroke_width")]
    pub width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLabel {
    pub position: Point,
    pub text: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_font_size")]
    pub font_size: f64,
}

/// Sticky note: a filled box with text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub position: Point,
    pub text: String,
    #[serde(default = "default_note_color")]
    pub color: String,
    #[serde(default = "default_note_width")]
    pub width: f64,
    #[serde(default = "default_note_height")]
    pub height: f64,
}

/// What an action draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ActionKind {
    Draw(Stroke),
    Erase(Stroke),
    Shape(Shape),
    Text(TextLabel),
    Note(Note),
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Draw(_) => "draw",
            ActionKind::Erase(_) => "erase",
            ActionKind::Shape(_) => "shape",
            ActionKind::Text(_) => "text",
            ActionKind::Note(_) => "note",
        }
    }
}

/// One committed whiteboard mutation. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingAction {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl DrawingAction {
    /// A fresh action authored by `author` now.
    pub fn new(kind: ActionKind, author: &Identity) -> Self {
        Self {
            id: new_id(),
            kind,
            user_id: author.user_id.clone(),
            user_name: author.user_name.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_wire_shape() {
        let action = DrawingAction::new(
            ActionKind::Draw(Stroke { points: vec![Point::new(1.0, 2.0)], color: "#f00".into(), width: 3.0 }),
            &Identity::new("u1", "Ada"),
        );
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "draw");
        assert_eq!(value["data"]["points"][0]["x"], 1.0);
        assert_eq!(value["user_name"], "Ada");
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn test_action_parses_with_defaults() {
        let action: DrawingAction = serde_json::from_value(json!({
            "type": "note",
            "data": {"position": {"x": 10, "y": 20}, "text": "buy filament"},
            "user_id": "u2"
        }))
        .unwrap();
        assert!(!action.id.is_empty());
        match action.kind {
            ActionKind::Note(note) => {
                assert_eq!(note.position, Point::new(10.0, 20.0));
                assert_eq!(note.color, DEFAULT_NOTE_COLOR);
                assert_eq!(note.width, DEFAULT_NOTE_WIDTH);
            }
            other => panic!("expected note, got {other:?}"),
        }
    }

    #[test]
    fn test_shape_kinds() {
        let action: DrawingAction = serde_json::from_value(json!({
            "id": "a1",
            "type": "shape",
            "data": {"shape": "circle", "start": {"x": 0, "y": 0}, "end": {"x": 3, "y": 4}},
            "user_id": "u2",
            "timestamp": "2024-05-01T12:00:00Z"
        }))
        .unwrap();
        assert_eq!(action.id, "a1");
        assert_eq!(action.kind.name(), "shape");
        if let ActionKind::Shape(shape) = action.kind {
            assert_eq!(shape.shape, ShapeKind::Circle);
            assert_eq!(shape.start.distance(shape.end), 5.0);
        }
    }

    #[test]
    fn test_unknown_action_type_rejected() {
        let parsed = serde_json::from_value::<DrawingAction>(json!({
            "type": "laser", "data": {}, "user_id": "u2"
        }));
        assert!(parsed.is_err());
    }
}
