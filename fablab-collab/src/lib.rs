//! # fablab-collab: Real-time collaboration core
//!
//! Keeps shared whiteboards and shared text documents consistent across
//! sessions without a server-side merge algorithm: every client applies the
//! same naive positional operations in the order its broker connection
//! delivers them.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐   JSON over WebSocket    ┌──────────────┐
//! │ EventStreamClient │ ◄──────────────────────── │ Event broker │
//! │ (per user)        │   subscribe/unsubscribe  └──────▲───────┘
//! └────────┬──────────┘                                 │
//!          │ dispatch (HandlerRegistry)                 │ fan-out
//!          ▼                                            │
//! ┌───────────────────┐   effects    ┌────────────────┐ │
//! │ Document/Whiteboard│ ───────────► │ Gateway (HTTP) │─┘
//! │ Session            │              │ fire-and-forget│
//! └────────┬──────────┘              └────────────────┘
//!          │ handle(input) -> effects
//!          ▼
//! ┌───────────────────┐  ┌─────────────────┐
//! │ Sync engine       │  │ PresenceTracker │
//! │ (pure reducer)    │  │ (TTL eviction)  │
//! └───────────────────┘  └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire format, event types, timestamps
//! - [`registry`]: typed handler registry with disposer handles
//! - [`client`]: reconnecting event-stream client
//! - [`presence`]: remote cursors with TTL and stable colors
//! - [`document`]: text document sync engine (edits, lock, auto-save)
//! - [`whiteboard`]: action-log whiteboard engine (replay, undo/redo)
//! - [`broadcast`]: HTTP broadcast gateway
//! - [`session`]: async drivers wiring engines to client, gateway and timers
//! - [`config`]: `COLLAB_*` environment configuration

pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod whiteboard;

// Re-exports for convenience
pub use broadcast::{Gateway, GatewayRequest, HttpGateway, LockRequest};
pub use client::{ConnectionState, EventStreamClient, ReconnectDecision, ReconnectPolicy};
pub use config::CollabConfig;
pub use document::{
    DocumentChange, DocumentCursor, DocumentEffect, DocumentInput, DocumentRecord, DocumentState,
    DocumentSyncEngine, LockChange, LockState, Operation, SyncStatus, apply_operation, derive_operation,
};
pub use error::{CollabError, HandlerError};
pub use presence::{ActiveEditor, CursorPosition, PresenceTracker, RemoteCursor, color_for_user};
pub use protocol::{ClientMessage, Event, EventType, Identity, ServerMessage};
pub use registry::{DispatchReport, HandlerRegistry, ListenerHandle, Topic};
pub use session::{DocumentSession, WhiteboardSession};
pub use whiteboard::{
    ActionKind, Canvas, DisplayList, DrawingAction, WhiteboardActionMessage, WhiteboardCursor,
    WhiteboardInput, WhiteboardSyncEngine, WhiteboardView,
};
