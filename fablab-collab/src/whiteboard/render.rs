//! Rendering drawing actions onto a [`Canvas`].
//!
//! The rendered image is a pure function of the action log: [`replay`]
//! clears the canvas and renders every action in order, [`render_action`]
//! renders one more on top. [`DisplayList`] records the primitive calls so
//! two renderings can be compared for equality.

use super::action::{ActionKind, DrawingAction, Point, ShapeKind};

const NOTE_TEXT_COLOR: &str = "#1f2937";
const NOTE_TEXT_SIZE: f64 = 14.0;
const NOTE_PADDING: f64 = 10.0;

/// Compositing mode of a path stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Composite {
    SourceOver,
    /// Erases whatever lies under the path.
    DestinationOut,
}

/// Stroke and fill of a closed shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Paint {
    pub stroke: Option<String>,
    pub line_width: f64,
    pub fill: Option<String>,
}

/// Drawing surface the whiteboard renders into.
pub trait Canvas {
    fn clear(&mut self);
    fn stroke_path(&mut self, points: &[Point], color: &str, width: f64, composite: Composite);
    fn rect(&mut self, origin: Point, width: f64, height: f64, paint: &Paint);
    fn circle(&mut self, center: Point, radius: f64, paint: &Paint);
    fn line(&mut self, from: Point, to: Point, color: &str, width: f64);
    fn text(&mut self, text: &str, at: Point, color: &str, font_size: f64);
}

/// One recorded canvas call.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Path { points: Vec<Point>, color: String, width: f64, composite: Composite },
    Rect { origin: Point, width: f64, height: f64, paint: Paint },
    Circle { center: Point, radius: f64, paint: Paint },
    Line { from: Point, to: Point, color: String, width: f64 },
    Text { text: String, at: Point, color: String, font_size: f64 },
}

/// Recording canvas. `clear` drops everything recorded so far, so the op
/// list always describes the visible image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayList {
    ops: Vec<DrawOp>,
}

impl DisplayList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Canvas for DisplayList {
    fn clear(&mut self) {
        self.ops.clear();
    }

    fn stroke_path(&mut self, points: &[Point], color: &str, width: f64, composite: Composite) {
        self.ops.push(DrawOp::Path { points: points.to_vec(), color: color.to_string(), width, composite });
    }

    fn rect(&mut self, origin: Point, width: f64, height: f64, paint: &Paint) {
        self.ops.push(DrawOp::Rect { origin, width, height, paint: paint.clone() });
    }

    fn circle(&mut self, center: Point, radius: f64, paint: &Paint) {
        self.ops.push(DrawOp::Circle { center, radius, paint: paint.clone() });
    }

    fn line(&mut self, from: Point, to: Point, color: &str, width: f64) {
        self.ops.push(DrawOp::Line { from, to, color: color.to_string(), width });
    }

    fn text(&mut self, text: &str, at: Point, color: &str, font_size: f64) {
        self.ops.push(DrawOp::Text { text: text.to_string(), at, color: color.to_string(), font_size });
    }
}

/// Render one action on top of the current canvas.
pub fn render_action<C: Canvas + ?Sized>(canvas: &mut C, action: &DrawingAction) {
    match &action.kind {
        ActionKind::Draw(stroke) | ActionKind::Erase(stroke) if stroke.points.is_empty() => {}
        ActionKind::Draw(stroke) => {
            canvas.stroke_path(&stroke.points, &stroke.color, stroke.width, Composite::SourceOver);
        }
        ActionKind::Erase(stroke) => {
            canvas.stroke_path(&stroke.points, &stroke.color, stroke.width, Composite::DestinationOut);
        }
        ActionKind::Shape(shape) => {
            let paint = Paint { stroke: Some(shape.color.clone()), line_width: shape.width, fill: shape.fill.clone() };
            match shape.shape {
                ShapeKind::Rectangle => {
                    let origin = Point::new(shape.start.x.min(shape.end.x), shape.start.y.min(shape.end.y));
                    let width = (shape.end.x - shape.start.x).abs();
                    let height = (shape.end.y - shape.start.y).abs();
                    canvas.rect(origin, width, height, &paint);
                }
                ShapeKind::Circle => canvas.circle(shape.start, shape.start.distance(shape.end), &paint),
                ShapeKind::Line => canvas.line(shape.start, shape.end, &shape.color, shape.width),
            }
        }
        ActionKind::Text(label) => canvas.text(&label.text, label.position, &label.color, label.font_size),
        ActionKind::Note(note) => {
            let paint = Paint { stroke: None, line_width: 0.0, fill: Some(note.color.clone()) };
            canvas.rect(note.position, note.width, note.height, &paint);
            let at = Point::new(note.position.x + NOTE_PADDING, note.position.y + NOTE_PADDING + NOTE_TEXT_SIZE);
            canvas.text(&note.text, at, NOTE_TEXT_COLOR, NOTE_TEXT_SIZE);
        }
    }
}

/// Clear the canvas and render `actions` in order.
pub fn replay<'a, C, I>(canvas: &mut C, actions: I)
where
    C: Canvas + ?Sized,
    I: IntoIterator<Item = &'a DrawingAction>,
{
    canvas.clear();
    for action in actions {
        render_action(canvas, action);
    }
}
