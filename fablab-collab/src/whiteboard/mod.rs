//! Shared whiteboard synchronization.
//!
//! The canvas is always reproducible from the ordered action log:
//!
//! ```text
//! local action ──► log.push ──► render_action ──► redo.clear() ──► Broadcast
//! remote action ─► (project + self filter) ──► log.push ──► render_action
//! undo ──► log.pop → redo.push ──► replay(log)          (full replay)
//! redo ──► redo.pop → log.push ──► render_action        (incremental)
//! ```
//!
//! Undo and redo are local only and never broadcast. They act on the last
//! action in the log, whoever authored it.

pub mod action;
pub mod render;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::GatewayRequest;
use crate::client::ConnectionState;
use crate::error::CollabError;
use crate::presence::{ActiveEditor, CursorPosition, PresenceTracker, RemoteCursor};
use crate::protocol::{timestamp, Event, EventType, Identity};

pub use action::{ActionKind, DrawingAction, Note, Point, Shape, ShapeKind, Stroke, TextLabel};
pub use render::{render_action, replay, Canvas, Composite, DisplayList, DrawOp, Paint};

/// Payload of `POST /collaboration/whiteboard/action` and of the
/// `whiteboard_action` broker event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteboardActionMessage {
    pub project_id: String,
    #[serde(flatten)]
    pub action: DrawingAction,
}

/// Payload of `POST /collaboration/whiteboard/cursor` and of the
/// `whiteboard_cursor` broker event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteboardCursor {
    pub project_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub tool: String,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl WhiteboardCursor {
    pub fn into_remote(self) -> RemoteCursor {
        RemoteCursor {
            surface_id: self.project_id,
            user_id: self.user_id,
            user_name: self.user_name,
            cursor: CursorPosition::Canvas { x: self.x, y: self.y, tool: self.tool },
        }
    }
}

#[derive(Debug, Clone)]
pub enum WhiteboardInput {
    Local(ActionKind),
    BeginStroke { erase: bool, at: Point, color: String, width: f64 },
    ExtendStroke(Point),
    EndStroke,
    LocalCursor { x: f64, y: f64, tool: String },
    Remote(WhiteboardActionMessage),
    RemoteCursor { cursor: WhiteboardCursor, now: Instant },
    Undo,
    Redo,
    /// Wipe the board; ignored unless `confirmed`.
    Clear { confirmed: bool },
    Tick(Instant),
    Connection(ConnectionState),
}

impl WhiteboardInput {
    /// Map a broker event onto an engine input. Non-whiteboard events yield `None`.
    pub fn from_event(event: &Event, now: Instant) -> Result<Option<Self>, CollabError> {
        Ok(match event.event_type {
            EventType::WhiteboardAction => Some(WhiteboardInput::Remote(event.payload_as()?)),
            EventType::WhiteboardCursor => Some(WhiteboardInput::RemoteCursor { cursor: event.payload_as()?, now }),
            _ => None,
        })
    }
}

/// UI-facing summary of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct WhiteboardView {
    pub project_id: String,
    pub action_count: usize,
    pub can_undo: bool,
    pub can_redo: bool,
    pub drawing: bool,
    pub editors: Vec<ActiveEditor>,
    pub connection: ConnectionState,
}

struct PendingStroke {
    erase: bool,
    stroke: Stroke,
}

impl PendingStroke {
    fn composite(&self) -> Composite {
        if self.erase {
            Composite::DestinationOut
        } else {
            Composite::SourceOver
        }
    }

    fn ink<C: Canvas>(&self, canvas: &mut C, points: &[Point]) {
        canvas.stroke_path(points, &self.stroke.color, self.stroke.width, self.composite());
    }
}

pub struct WhiteboardSyncEngine<C: Canvas = DisplayList> {
    project_id: String,
    local: Identity,
    log: Vec<DrawingAction>,
    redo: Vec<DrawingAction>,
    pending: Option<PendingStroke>,
    canvas: C,
    presence: PresenceTracker,
    connection: ConnectionState,
}

impl WhiteboardSyncEngine<DisplayList> {
    /// Engine rendering into a fresh [`DisplayList`].
    pub fn headless(project_id: impl Into<String>, local: Identity, initial: Vec<DrawingAction>, presence_ttl: Duration) -> Self {
        Self::new(project_id, local, initial, DisplayList::new(), presence_ttl)
    }
}

impl<C: Canvas> WhiteboardSyncEngine<C> {
    /// Load `initial` (as returned by `GET /projects/{id}/whiteboard`) and
    /// render it with a full replay.
    pub fn new(
        project_id: impl Into<String>,
        local: Identity,
        initial: Vec<DrawingAction>,
        mut canvas: C,
        presence_ttl: Duration,
    ) -> Self {
        let project_id = project_id.into();
        replay(&mut canvas, &initial);
        Self {
            presence: PresenceTracker::new(project_id.clone(), local.user_id.clone(), presence_ttl),
            project_id,
            local,
            log: initial,
            redo: Vec::new(),
            pending: None,
            canvas,
            connection: ConnectionState::Disconnected,
        }
    }

    pub fn handle(&mut self, input: WhiteboardInput) -> Vec<GatewayRequest> {
        match input {
            WhiteboardInput::Local(kind) => vec![self.apply_local(kind)],
            WhiteboardInput::BeginStroke { erase, at, color, width } => {
                self.begin_stroke(erase, at, color, width).into_iter().collect()
            }
            WhiteboardInput::ExtendStroke(point) => {
                self.extend_stroke(point);
                Vec::new()
            }
            WhiteboardInput::EndStroke => self.end_stroke().into_iter().collect(),
            WhiteboardInput::LocalCursor { x, y, tool } => vec![self.local_cursor(x, y, tool)],
            WhiteboardInput::Remote(message) => {
                self.apply_remote(message);
                Vec::new()
            }
            WhiteboardInput::RemoteCursor { cursor, now } => {
                self.presence.on_remote_cursor(cursor.into_remote(), now);
                Vec::new()
            }
            WhiteboardInput::Undo => {
                self.undo();
                Vec::new()
            }
            WhiteboardInput::Redo => {
                self.redo();
                Vec::new()
            }
            WhiteboardInput::Clear { confirmed } => {
                self.clear(confirmed);
                Vec::new()
            }
            WhiteboardInput::Tick(now) => {
                self.presence.tick(now);
                Vec::new()
            }
            WhiteboardInput::Connection(state) => {
                self.connection = state;
                Vec::new()
            }
        }
    }

    /// Commit a local action and return its broadcast.
    pub fn apply_local(&mut self, kind: ActionKind) -> GatewayRequest {
        let action = DrawingAction::new(kind, &self.local);
        render_action(&mut self.canvas, &action);
        self.commit(action)
    }

    fn commit(&mut self, action: DrawingAction) -> GatewayRequest {
        self.log.push(action.clone());
        self.redo.clear();
        GatewayRequest::WhiteboardAction(WhiteboardActionMessage { project_id: self.project_id.clone(), action })
    }

    /// Start accumulating a freehand stroke and ink its first point. A stroke
    /// still in progress is committed first, and its broadcast returned.
    pub fn begin_stroke(&mut self, erase: bool, at: Point, color: String, width: f64) -> Option<GatewayRequest> {
        let previous = self.end_stroke();
        let pending = PendingStroke { erase, stroke: Stroke { points: vec![at], color, width } };
        pending.ink(&mut self.canvas, &[at]);
        self.pending = Some(pending);
        previous
    }

    /// Append a point to the stroke in progress and ink the new segment.
    /// Returns `false` without a stroke in progress.
    pub fn extend_stroke(&mut self, point: Point) -> bool {
        let Some(pending) = &mut self.pending else {
            return false;
        };
        let last = pending.stroke.points.last().copied().unwrap_or(point);
        pending.stroke.points.push(point);
        pending.ink(&mut self.canvas, &[last, point]);
        true
    }

    /// Commit the stroke in progress as a single action.
    ///
    /// The per-segment ink is replaced by one replay of the log, so the canvas
    /// matches what every other session renders for the same action.
    pub fn end_stroke(&mut self) -> Option<GatewayRequest> {
        let pending = self.pending.take()?;
        let kind = if pending.erase { ActionKind::Erase(pending.stroke) } else { ActionKind::Draw(pending.stroke) };
        let request = self.commit(DrawingAction::new(kind, &self.local));
        replay(&mut self.canvas, &self.log);
        Some(request)
    }

    pub fn stroke_in_progress(&self) -> Option<&Stroke> {
        self.pending.as_ref().map(|p| &p.stroke)
    }

    fn local_cursor(&self, x: f64, y: f64, tool: String) -> GatewayRequest {
        GatewayRequest::WhiteboardCursor(WhiteboardCursor {
            project_id: self.project_id.clone(),
            user_id: self.local.user_id.clone(),
            user_name: self.local.user_name.clone(),
            x,
            y,
            tool,
            timestamp: Utc::now(),
        })
    }

    /// Apply an action from another session. Returns whether it was appended.
    ///
    /// Actions for other projects, the local user's own echoes, and ids
    /// already in the log are skipped. Undo/redo stacks are untouched.
    pub fn apply_remote(&mut self, message: WhiteboardActionMessage) -> bool {
        if message.project_id != self.project_id || self.local.is(&message.action.user_id) {
            return false;
        }
        if self.log.iter().any(|a| a.id == message.action.id) {
            log::debug!("Skipping duplicate whiteboard action {}", message.action.id);
            return false;
        }
        render_action(&mut self.canvas, &message.action);
        self.log.push(message.action);
        true
    }

    /// Move the last action to the redo stack and re-render from scratch.
    pub fn undo(&mut self) -> bool {
        let Some(action) = self.log.pop() else {
            return false;
        };
        self.redo.push(action);
        replay(&mut self.canvas, &self.log);
        if let Some(pending) = &self.pending {
            pending.ink(&mut self.canvas, &pending.stroke.points);
        }
        true
    }

    /// Move the last undone action back onto the log.
    pub fn redo(&mut self) -> bool {
        let Some(action) = self.redo.pop() else {
            return false;
        };
        render_action(&mut self.canvas, &action);
        self.log.push(action);
        true
    }

    /// Wipe log, stacks and canvas. Local only; requires confirmation.
    pub fn clear(&mut self, confirmed: bool) -> bool {
        if !confirmed {
            return false;
        }
        self.log.clear();
        self.redo.clear();
        self.pending = None;
        self.canvas.clear();
        true
    }

    pub fn actions(&self) -> &[DrawingAction] {
        &self.log
    }

    pub fn redo_stack(&self) -> &[DrawingAction] {
        &self.redo
    }

    pub fn canvas(&self) -> &C {
        &self.canvas
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn view(&self) -> WhiteboardView {
        WhiteboardView {
            project_id: self.project_id.clone(),
            action_count: self.log.len(),
            can_undo: !self.log.is_empty(),
            can_redo: !self.redo.is_empty(),
            drawing: self.pending.is_some(),
            editors: self.presence.editors(),
            connection: self.connection,
        }
    }
}
