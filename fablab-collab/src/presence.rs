//! Presence tracking for remote cursors and selections.
//!
//! Each open surface (a document or a project whiteboard) keeps one
//! [`PresenceTracker`]. Remote cursor events upsert an [`ActiveEditor`] keyed
//! by `user_id`; a periodic [`tick`](PresenceTracker::tick) evicts entries
//! whose last activity is older than the TTL.
//!
//! ```text
//! remote cursor event ──► on_remote_cursor()   (surface + self filter, upsert)
//!                                │
//! every 5s ──────────────► tick()              (evict now - last_activity > ttl)
//!                                │
//!                                ▼
//!                          editors()           (sorted, for rendering)
//! ```
//!
//! All methods take `now` explicitly so eviction is deterministic in tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Cursor colors, indexed by [`color_for_user`].
pub const PALETTE: [&str; 10] = [
    "#ef4444", "#f97316", "#eab308", "#22c55e", "#14b8a6",
    "#3b82f6", "#6366f1", "#a855f7", "#ec4899", "#64748b",
];

/// Stable color for a user: the same id always maps to the same palette entry.
///
/// Uses the classic `h * 31 + c` string hash so the mapping does not depend
/// on the process (unlike `std`'s randomly seeded hasher).
pub fn color_for_user(user_id: &str) -> &'static str {
    let hash = user_id
        .chars()
        .fold(0i32, |h, c| (c as i32).wrapping_add(h.wrapping_shl(5).wrapping_sub(h)));
    PALETTE[hash.unsigned_abs() as usize % PALETTE.len()]
}

/// Where a remote user is pointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CursorPosition {
    /// Caret and optional selection in a text document (character offsets).
    Text {
        position: usize,
        selection_start: Option<usize>,
        selection_end: Option<usize>,
    },
    /// Pointer on the whiteboard canvas.
    Canvas { x: f64, y: f64, tool: String },
}

/// A cursor update received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    /// Document id or project id the cursor belongs to.
    pub surface_id: String,
    pub user_id: String,
    pub user_name: String,
    pub cursor: CursorPosition,
}

/// One remote user's live presence on a surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEditor {
    pub user_id: String,
    pub user_name: String,
    pub cursor: CursorPosition,
    pub last_activity: Instant,
    pub color: &'static str,
}

impl ActiveEditor {
    /// Whether this entry has outlived `ttl` at `now`.
    pub fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > ttl
    }
}

/// Remote presence for one open surface.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    surface_id: String,
    local_user_id: String,
    ttl: Duration,
    editors: HashMap<String, ActiveEditor>,
}

impl PresenceTracker {
    pub fn new(surface_id: impl Into<String>, local_user_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            surface_id: surface_id.into(),
            local_user_id: local_user_id.into(),
            ttl,
            editors: HashMap::new(),
        }
    }

    /// Upsert a remote cursor. Returns `false` when the update was filtered
    /// out (other surface, or the local user's own echo).
    pub fn on_remote_cursor(&mut self, update: RemoteCursor, now: Instant) -> bool {
        if update.surface_id != self.surface_id || update.user_id == self.local_user_id {
            return false;
        }
        let color = color_for_user(&update.user_id);
        self.editors.insert(
            update.user_id.clone(),
            ActiveEditor {
                user_id: update.user_id,
                user_name: update.user_name,
                cursor: update.cursor,
                last_activity: now,
                color,
            },
        );
        true
    }

    /// Evict stale entries; returns the evicted user ids.
    pub fn tick(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        let stale: Vec<String> = self
            .editors
            .values()
            .filter(|e| e.is_stale(now, ttl))
            .map(|e| e.user_id.clone())
            .collect();
        for id in &stale {
            self.editors.remove(id);
            log::debug!("Presence: evicted idle user {id} from {}", self.surface_id);
        }
        stale
    }

    /// Drop one user immediately (explicit leave).
    pub fn remove(&mut self, user_id: &str) -> Option<ActiveEditor> {
        self.editors.remove(user_id)
    }

    pub fn clear(&mut self) {
        self.editors.clear();
    }

    /// Live editors, sorted by name then id for stable rendering.
    pub fn editors(&self) -> Vec<ActiveEditor> {
        let mut list: Vec<ActiveEditor> = self.editors.values().cloned().collect();
        list.sort_by(|a, b| a.user_name.cmp(&b.user_name).then_with(|| a.user_id.cmp(&b.user_id)));
        list
    }

    pub fn get(&self, user_id: &str) -> Option<&ActiveEditor> {
        self.editors.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.editors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.editors.is_empty()
    }

    pub fn surface_id(&self) -> &str {
        &self.surface_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
