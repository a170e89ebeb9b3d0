//! Shared text document synchronization.
//!
//! The engine is a plain reducer: [`DocumentSyncEngine::handle`] takes a
//! [`DocumentInput`], mutates local state, and returns the
//! [`DocumentEffect`]s the caller must execute (gateway calls, timers,
//! persistence). It never performs I/O itself.
//!
//! Edits travel as naive positional operations: an insert or delete at a
//! character offset, applied by every receiver against whatever its buffer
//! looks like at that moment. There is no transformation step, so concurrent
//! edits may converge differently at different observers.
//!
//! ```text
//! local edit ──► derive_operation(old, new, caret) ──► Broadcast(change)
//!                                                  └─► ScheduleAutosave
//! remote change ──► (document + self filter) ──► apply_operation(buffer)
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::{GatewayRequest, LockRequest};
use crate::client::ConnectionState;
use crate::config::CollabConfig;
use crate::error::CollabError;
use crate::presence::{CursorPosition, PresenceTracker, RemoteCursor};
use crate::protocol::{timestamp, Event, EventType, Identity};

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Delete,
    /// Accepted on the wire, never applied.
    Format,
}

/// One positional edit, as broadcast by `POST /collaboration/document/change`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub document_id: String,
    #[serde(default)]
    pub project_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    pub operation: Operation,
    pub position: usize,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// A caret/selection update, as broadcast by `POST /collaboration/document/cursor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCursor {
    pub document_id: String,
    #[serde(default)]
    pub project_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<usize>,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl DocumentCursor {
    pub fn into_remote(self) -> RemoteCursor {
        RemoteCursor {
            surface_id: self.document_id,
            user_id: self.user_id,
            user_name: self.user_name,
            cursor: CursorPosition::Text {
                position: self.position,
                selection_start: self.selection_start,
                selection_end: self.selection_end,
            },
        }
    }
}

/// Payload of a `document_lock` broker event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockChange {
    pub document_id: String,
    pub locked: bool,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub locked_by_name: Option<String>,
}

/// Document as returned by `GET /documents/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub locked_by_name: Option<String>,
}

// =============================================================================
// TEXT OPERATIONS
// =============================================================================

/// Operation derived from a single local mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOp {
    pub operation: Operation,
    pub position: usize,
    pub content: String,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte index of the `index`-th character, clamped to the end of `s`.
fn byte_offset(s: &str, index: usize) -> usize {
    s.char_indices().nth(index).map_or(s.len(), |(i, _)| i)
}

fn char_slice(s: &str, start: usize, end: usize) -> &str {
    &s[byte_offset(s, start)..byte_offset(s, end)]
}

/// Derive the edit that turned `old` into `new`, given the caret offset
/// after the mutation. Assumes one contiguous edit.
///
/// Equal lengths derive nothing: replacements and formatting are not
/// expressed as operations.
pub fn derive_operation(old: &str, new: &str, caret: usize) -> Option<EditOp> {
    let (old_len, new_len) = (char_len(old), char_len(new));
    if new_len > old_len {
        let delta = new_len - old_len;
        let end = caret.min(new_len).max(delta);
        let start = end - delta;
        Some(EditOp {
            operation: Operation::Insert,
            position: start,
            content: char_slice(new, start, end).to_string(),
        })
    } else if new_len < old_len {
        let delta = old_len - new_len;
        let start = caret.min(new_len);
        Some(EditOp {
            operation: Operation::Delete,
            position: start,
            content: char_slice(old, start, start + delta).to_string(),
        })
    } else {
        None
    }
}

/// Apply a positional operation to `buffer`. Out-of-range positions are
/// clamped to the buffer; `format` is a no-op.
pub fn apply_operation(buffer: &mut String, operation: Operation, position: usize, content: &str) {
    match operation {
        Operation::Insert => {
            let at = byte_offset(buffer, position);
            buffer.insert_str(at, content);
        }
        Operation::Delete => {
            let start = byte_offset(buffer, position);
            let end = byte_offset(buffer, position.saturating_add(char_len(content)));
            buffer.replace_range(start..end, "");
        }
        Operation::Format => {}
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unlocked,
    Locked { owner: String, owner_name: Option<String> },
}

impl LockState {
    pub fn owner(&self) -> Option<&str> {
        match self {
            LockState::Unlocked => None,
            LockState::Locked { owner, .. } => Some(owner),
        }
    }

    /// The owner, if someone other than `local` holds the lock.
    pub fn held_by_other(&self, local: &Identity) -> Option<&str> {
        self.owner().filter(|owner| !local.is(owner))
    }

    fn from_wire(locked: bool, owner: Option<String>, owner_name: Option<String>) -> Self {
        if locked {
            LockState::Locked { owner: owner.unwrap_or_default(), owner_name }
        } else {
            LockState::Unlocked
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Synced,
    Saving,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Saving => "saving",
            SyncStatus::Error => "error",
        })
    }
}

/// Everything a document view renders.
#[derive(Debug, Clone)]
pub struct DocumentState {
    pub document_id: String,
    pub project_id: String,
    pub title: String,
    pub content: String,
    pub lock: LockState,
    pub status: SyncStatus,
    /// Local edits not yet confirmed saved.
    pub dirty: bool,
    /// Bumped on every local edit; saves report the revision they wrote.
    pub revision: u64,
    pub last_error: Option<String>,
    pub presence: PresenceTracker,
    pub connection: ConnectionState,
}

// =============================================================================
// ENGINE
// =============================================================================

#[derive(Debug, Clone)]
pub enum DocumentInput {
    /// The local buffer now reads `content`; `caret` is the caret offset after the change.
    LocalEdit { content: String, caret: usize },
    LocalCursor { position: usize, selection_start: Option<usize>, selection_end: Option<usize> },
    RemoteChange(DocumentChange),
    RemoteCursor { cursor: DocumentCursor, now: Instant },
    RemoteLock(LockChange),
    RequestLock,
    ReleaseLock,
    SaveRequested,
    AutosaveElapsed,
    SaveCompleted { revision: u64, result: Result<(), String> },
    Tick(Instant),
    Connection(ConnectionState),
}

impl DocumentInput {
    /// Map a broker event onto an engine input. Non-document events yield `None`.
    pub fn from_event(event: &Event, now: Instant) -> Result<Option<Self>, CollabError> {
        Ok(match event.event_type {
            EventType::DocumentChange => Some(DocumentInput::RemoteChange(event.payload_as()?)),
            EventType::DocumentCursor => Some(DocumentInput::RemoteCursor { cursor: event.payload_as()?, now }),
            EventType::DocumentLock => Some(DocumentInput::RemoteLock(event.payload_as()?)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEffect {
    /// Fire-and-forget gateway publish.
    Broadcast(GatewayRequest),
    /// (Re)start the auto-save debounce timer.
    ScheduleAutosave(Duration),
    CancelAutosave,
    /// `PUT /documents/{id}`; report back with [`DocumentInput::SaveCompleted`].
    Persist { document_id: String, content: String, revision: u64 },
}

pub struct DocumentSyncEngine {
    local: Identity,
    autosave_debounce: Duration,
    state: DocumentState,
}

impl DocumentSyncEngine {
    pub fn new(record: DocumentRecord, local: Identity, config: &CollabConfig) -> Self {
        let presence = PresenceTracker::new(record.id.clone(), local.user_id.clone(), config.presence_ttl);
        Self {
            state: DocumentState {
                lock: LockState::from_wire(record.locked, record.locked_by, record.locked_by_name),
                document_id: record.id,
                project_id: record.project_id,
                title: record.title,
                content: record.content,
                status: SyncStatus::Synced,
                dirty: false,
                revision: 0,
                last_error: None,
                presence,
                connection: ConnectionState::Disconnected,
            },
            local,
            autosave_debounce: config.autosave_debounce,
        }
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn content(&self) -> &str {
        &self.state.content
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    /// Whether local input should be disabled.
    pub fn is_read_only(&self) -> bool {
        self.state.lock.held_by_other(&self.local).is_some()
    }

    pub fn handle(&mut self, input: DocumentInput) -> Result<Vec<DocumentEffect>, CollabError> {
        match input {
            DocumentInput::LocalEdit { content, caret } => self.local_edit(content, caret),
            DocumentInput::LocalCursor { position, selection_start, selection_end } => {
                Ok(vec![self.local_cursor(position, selection_start, selection_end)])
            }
            DocumentInput::RemoteChange(change) => {
                self.apply_remote(&change);
                Ok(Vec::new())
            }
            DocumentInput::RemoteCursor { cursor, now } => {
                self.state.presence.on_remote_cursor(cursor.into_remote(), now);
                Ok(Vec::new())
            }
            DocumentInput::RemoteLock(change) => {
                self.apply_remote_lock(change);
                Ok(Vec::new())
            }
            DocumentInput::RequestLock => self.request_lock(),
            DocumentInput::ReleaseLock => self.release_lock(),
            DocumentInput::SaveRequested => Ok(vec![DocumentEffect::CancelAutosave, self.persist()]),
            DocumentInput::AutosaveElapsed => Ok(if self.state.dirty { vec![self.persist()] } else { Vec::new() }),
            DocumentInput::SaveCompleted { revision, result } => {
                self.save_completed(revision, result);
                Ok(Vec::new())
            }
            DocumentInput::Tick(now) => {
                self.state.presence.tick(now);
                Ok(Vec::new())
            }
            DocumentInput::Connection(state) => {
                self.state.connection = state;
                Ok(Vec::new())
            }
        }
    }

    fn local_edit(&mut self, content: String, caret: usize) -> Result<Vec<DocumentEffect>, CollabError> {
        if let Some(owner) = self.state.lock.held_by_other(&self.local) {
            return Err(CollabError::DocumentLocked { owner: owner.to_string() });
        }
        if content == self.state.content {
            return Ok(Vec::new());
        }

        let op = derive_operation(&self.state.content, &content, caret);
        self.state.content = content;
        self.state.revision += 1;
        self.state.dirty = true;

        let mut effects = Vec::with_capacity(2);
        if let Some(op) = op {
            effects.push(DocumentEffect::Broadcast(GatewayRequest::DocumentChange(DocumentChange {
                id: Uuid::new_v4().to_string(),
                document_id: self.state.document_id.clone(),
                project_id: self.state.project_id.clone(),
                user_id: self.local.user_id.clone(),
                user_name: self.local.user_name.clone(),
                operation: op.operation,
                position: op.position,
                content: op.content,
                timestamp: Utc::now(),
            })));
        }
        effects.push(DocumentEffect::ScheduleAutosave(self.autosave_debounce));
        Ok(effects)
    }

    fn local_cursor(
        &self,
        position: usize,
        selection_start: Option<usize>,
        selection_end: Option<usize>,
    ) -> DocumentEffect {
        DocumentEffect::Broadcast(GatewayRequest::DocumentCursor(DocumentCursor {
            document_id: self.state.document_id.clone(),
            project_id: self.state.project_id.clone(),
            user_id: self.local.user_id.clone(),
            user_name: self.local.user_name.clone(),
            position,
            selection_start,
            selection_end,
            timestamp: Utc::now(),
        }))
    }

    /// Apply a change from another session. Returns whether the buffer was touched.
    pub fn apply_remote(&mut self, change: &DocumentChange) -> bool {
        if change.document_id != self.state.document_id || self.local.is(&change.user_id) {
            return false;
        }
        if change.operation == Operation::Format {
            log::debug!("Ignoring format operation {} on {}", change.id, change.document_id);
            return false;
        }
        apply_operation(&mut self.state.content, change.operation, change.position, &change.content);
        true
    }

    fn apply_remote_lock(&mut self, change: LockChange) {
        if change.document_id != self.state.document_id {
            return;
        }
        self.state.lock = LockState::from_wire(change.locked, change.locked_by, change.locked_by_name);
        log::debug!("Document {} lock is now {:?}", self.state.document_id, self.state.lock);
    }

    fn request_lock(&mut self) -> Result<Vec<DocumentEffect>, CollabError> {
        if let Some(owner) = self.state.lock.held_by_other(&self.local) {
            return Err(CollabError::DocumentLocked { owner: owner.to_string() });
        }
        if self.state.lock.owner().is_some() {
            return Ok(Vec::new());
        }
        self.state.lock = LockState::Locked {
            owner: self.local.user_id.clone(),
            owner_name: Some(self.local.user_name.clone()),
        };
        Ok(vec![self.lock_broadcast(true)])
    }

    fn release_lock(&mut self) -> Result<Vec<DocumentEffect>, CollabError> {
        if let Some(owner) = self.state.lock.held_by_other(&self.local) {
            return Err(CollabError::NotLockOwner { owner: owner.to_string() });
        }
        if self.state.lock == LockState::Unlocked {
            return Ok(Vec::new());
        }
        self.state.lock = LockState::Unlocked;
        Ok(vec![self.lock_broadcast(false)])
    }

    fn lock_broadcast(&self, locked: bool) -> DocumentEffect {
        DocumentEffect::Broadcast(GatewayRequest::DocumentLock {
            document_id: self.state.document_id.clone(),
            request: LockRequest { locked, project_id: self.state.project_id.clone() },
        })
    }

    fn persist(&mut self) -> DocumentEffect {
        self.state.status = SyncStatus::Saving;
        DocumentEffect::Persist {
            document_id: self.state.document_id.clone(),
            content: self.state.content.clone(),
            revision: self.state.revision,
        }
    }

    fn save_completed(&mut self, revision: u64, result: Result<(), String>) {
        match result {
            Ok(()) => {
                self.state.status = SyncStatus::Synced;
                self.state.last_error = None;
                if revision == self.state.revision {
                    self.state.dirty = false;
                }
            }
            Err(e) => {
                log::warn!("Saving document {} failed: {e}", self.state.document_id);
                self.state.status = SyncStatus::Error;
                self.state.last_error = Some(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(content: &str) -> DocumentSyncEngine {
        let record = DocumentRecord {
            id: "doc-1".into(),
            project_id: "proj-1".into(),
            content: content.into(),
            ..Default::default()
        };
        DocumentSyncEngine::new(record, Identity::new("me", "Me"), &CollabConfig::default())
    }

    fn remote(operation: Operation, position: usize, content: &str) -> DocumentChange {
        DocumentChange {
            id: "c1".into(),
            document_id: "doc-1".into(),
            project_id: "proj-1".into(),
            user_id: "other".into(),
            user_name: "Other".into(),
            operation,
            position,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    fn broadcasts(effects: &[DocumentEffect]) -> Vec<&GatewayRequest> {
        effects
            .iter()
            .filter_map(|e| match e {
                DocumentEffect::Broadcast(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_derive_insert() {
        let op = derive_operation("hello", "hello world", 11).unwrap();
        assert_eq!(op, EditOp { operation: Operation::Insert, position: 5, content: " world".into() });
    }

    #[test]
    fn test_derive_delete() {
        let op = derive_operation("hello world", "hello", 5).unwrap();
        assert_eq!(op, EditOp { operation: Operation::Delete, position: 5, content: " world".into() });
    }

    #[test]
    fn test_derive_insert_in_middle() {
        let op = derive_operation("helo", "hello", 4).unwrap();
        assert_eq!(op.position, 3);
        assert_eq!(op.content, "l");
    }

    #[test]
    fn test_derive_equal_length_is_nothing() {
        assert!(derive_operation("abc", "abd", 3).is_none());
    }

    #[test]
    fn test_derive_uses_character_offsets() {
        let op = derive_operation("né", "néé!", 4).unwrap();
        assert_eq!(op, EditOp { operation: Operation::Insert, position: 2, content: "é!".into() });

        let op = derive_operation("日本語", "日", 1).unwrap();
        assert_eq!(op, EditOp { operation: Operation::Delete, position: 1, content: "本語".into() });
    }

    #[test]
    fn test_derive_clamps_bad_caret() {
        let op = derive_operation("ab", "abcd", 99).unwrap();
        assert_eq!(op.position, 2);
        assert_eq!(op.content, "cd");
        let op = derive_operation("abcd", "ab", 99).unwrap();
        assert_eq!(op.position, 2);
        assert_eq!(op.content, "cd");
    }

    #[test]
    fn test_apply_insert_and_delete() {
        let mut buf = "abc".to_string();
        apply_operation(&mut buf, Operation::Insert, 1, "X");
        assert_eq!(buf, "aXbc");

        let mut buf = "abc".to_string();
        apply_operation(&mut buf, Operation::Delete, 0, "a");
        assert_eq!(buf, "bc");
    }

    #[test]
    fn test_apply_clamps_out_of_range() {
        let mut buf = "abc".to_string();
        apply_operation(&mut buf, Operation::Insert, 40, "!");
        assert_eq!(buf, "abc!");
        apply_operation(&mut buf, Operation::Delete, 2, "longer than the rest");
        assert_eq!(buf, "ab");
        apply_operation(&mut buf, Operation::Delete, 10, "x");
        assert_eq!(buf, "ab");
    }

    #[test]
    fn test_apply_format_is_noop() {
        let mut buf = "abc".to_string();
        apply_operation(&mut buf, Operation::Format, 0, "bold");
        assert_eq!(buf, "abc");
    }

    #[test]
    fn test_local_edit_broadcasts_and_schedules_autosave() {
        let mut engine = engine("hello");
        let effects = engine
            .handle(DocumentInput::LocalEdit { content: "hello world".into(), caret: 11 })
            .unwrap();

        assert_eq!(engine.content(), "hello world");
        assert!(engine.state().dirty);
        match broadcasts(&effects).as_slice() {
            [GatewayRequest::DocumentChange(change)] => {
                assert_eq!(change.operation, Operation::Insert);
                assert_eq!(change.position, 5);
                assert_eq!(change.content, " world");
                assert_eq!(change.user_id, "me");
                assert_eq!(change.project_id, "proj-1");
            }
            other => panic!("unexpected broadcasts {other:?}"),
        }
        assert_eq!(effects.last(), Some(&DocumentEffect::ScheduleAutosave(Duration::from_millis(2000))));
    }

    #[test]
    fn test_unchanged_edit_emits_nothing() {
        let mut engine = engine("same");
        let effects = engine.handle(DocumentInput::LocalEdit { content: "same".into(), caret: 4 }).unwrap();
        assert!(effects.is_empty());
        assert!(!engine.state().dirty);
    }

    #[test]
    fn test_remote_change_applied() {
        let mut engine = engine("abc");
        engine.handle(DocumentInput::RemoteChange(remote(Operation::Insert, 1, "X"))).unwrap();
        assert_eq!(engine.content(), "aXbc");
        engine.handle(DocumentInput::RemoteChange(remote(Operation::Delete, 0, "a"))).unwrap();
        assert_eq!(engine.content(), "Xbc");
        assert!(!engine.state().dirty);
    }

    #[test]
    fn test_remote_change_from_self_ignored() {
        let mut engine = engine("abc");
        let mut change = remote(Operation::Insert, 0, "X");
        change.user_id = "me".into();
        assert!(!engine.apply_remote(&change));
        assert_eq!(engine.content(), "abc");
    }

    #[test]
    fn test_remote_change_for_other_document_ignored() {
        let mut engine = engine("abc");
        let mut change = remote(Operation::Insert, 0, "X");
        change.document_id = "doc-2".into();
        assert!(!engine.apply_remote(&change));
        assert_eq!(engine.content(), "abc");
    }

    #[test]
    fn test_locked_by_other_rejects_edit() {
        let mut engine = engine("abc");
        engine
            .handle(DocumentInput::RemoteLock(LockChange {
                document_id: "doc-1".into(),
                locked: true,
                locked_by: Some("other".into()),
                locked_by_name: Some("Other".into()),
            }))
            .unwrap();
        assert!(engine.is_read_only());

        let err = engine
            .handle(DocumentInput::LocalEdit { content: "abcd".into(), caret: 4 })
            .unwrap_err();
        assert!(matches!(err, CollabError::DocumentLocked { ref owner } if owner == "other"));
        assert_eq!(engine.content(), "abc");
        assert_eq!(engine.state().revision, 0);
    }

    #[test]
    fn test_remote_changes_still_apply_while_locked() {
        let mut engine = engine("abc");
        engine.handle(DocumentInput::RemoteLock(LockChange {
            document_id: "doc-1".into(),
            locked: true,
            locked_by: Some("other".into()),
            locked_by_name: None,
        }))
        .unwrap();
        engine.handle(DocumentInput::RemoteChange(remote(Operation::Insert, 3, "d"))).unwrap();
        assert_eq!(engine.content(), "abcd");
    }

    #[test]
    fn test_lock_by_self_allows_edit() {
        let mut engine = engine("abc");
        let effects = engine.handle(DocumentInput::RequestLock).unwrap();
        assert_eq!(
            effects,
            vec![DocumentEffect::Broadcast(GatewayRequest::DocumentLock {
                document_id: "doc-1".into(),
                request: LockRequest { locked: true, project_id: "proj-1".into() },
            })]
        );
        assert_eq!(engine.state().lock.owner(), Some("me"));
        assert!(!engine.is_read_only());
        assert!(engine.handle(DocumentInput::LocalEdit { content: "abcd".into(), caret: 4 }).is_ok());

        // requesting again is a no-op
        assert!(engine.handle(DocumentInput::RequestLock).unwrap().is_empty());
    }

    #[test]
    fn test_only_owner_releases_lock() {
        let mut engine = engine("abc");
        assert!(engine.handle(DocumentInput::ReleaseLock).unwrap().is_empty());

        engine.handle(DocumentInput::RemoteLock(LockChange {
            document_id: "doc-1".into(),
            locked: true,
            locked_by: Some("other".into()),
            locked_by_name: None,
        }))
        .unwrap();
        assert!(matches!(
            engine.handle(DocumentInput::ReleaseLock),
            Err(CollabError::NotLockOwner { .. })
        ));
        assert!(matches!(engine.handle(DocumentInput::RequestLock), Err(CollabError::DocumentLocked { .. })));

        engine.handle(DocumentInput::RemoteLock(LockChange {
            document_id: "doc-1".into(),
            locked: false,
            locked_by: None,
            locked_by_name: None,
        }))
        .unwrap();
        engine.handle(DocumentInput::RequestLock).unwrap();
        let effects = engine.handle(DocumentInput::ReleaseLock).unwrap();
        assert_eq!(effects.len(), 1);
        assert_eq!(engine.state().lock, LockState::Unlocked);
    }

    #[test]
    fn test_initial_lock_from_record() {
        let record = DocumentRecord {
            id: "doc-1".into(),
            locked: true,
            locked_by: Some("other".into()),
            ..Default::default()
        };
        let engine = DocumentSyncEngine::new(record, Identity::new("me", "Me"), &CollabConfig::default());
        assert!(engine.is_read_only());
    }

    #[test]
    fn test_manual_save_cancels_debounce() {
        let mut engine = engine("abc");
        engine.handle(DocumentInput::LocalEdit { content: "abcd".into(), caret: 4 }).unwrap();
        let effects = engine.handle(DocumentInput::SaveRequested).unwrap();
        assert_eq!(
            effects,
            vec![
                DocumentEffect::CancelAutosave,
                DocumentEffect::Persist { document_id: "doc-1".into(), content: "abcd".into(), revision: 1 },
            ]
        );
        assert_eq!(engine.state().status, SyncStatus::Saving);

        engine.handle(DocumentInput::SaveCompleted { revision: 1, result: Ok(()) }).unwrap();
        assert_eq!(engine.state().status, SyncStatus::Synced);
        assert!(!engine.state().dirty);
    }

    #[test]
    fn test_autosave_skipped_when_clean() {
        let mut engine = engine("abc");
        assert!(engine.handle(DocumentInput::AutosaveElapsed).unwrap().is_empty());
        engine.handle(DocumentInput::LocalEdit { content: "ab".into(), caret: 2 }).unwrap();
        assert_eq!(engine.handle(DocumentInput::AutosaveElapsed).unwrap().len(), 1);
    }

    #[test]
    fn test_save_failure_sets_error_and_keeps_dirty() {
        let mut engine = engine("abc");
        engine.handle(DocumentInput::LocalEdit { content: "abcd".into(), caret: 4 }).unwrap();
        engine.handle(DocumentInput::AutosaveElapsed).unwrap();
        engine
            .handle(DocumentInput::SaveCompleted { revision: 1, result: Err("503".into()) })
            .unwrap();
        assert_eq!(engine.state().status, SyncStatus::Error);
        assert_eq!(engine.state().last_error.as_deref(), Some("503"));
        assert!(engine.state().dirty);
    }

    #[test]
    fn test_stale_save_leaves_dirty() {
        let mut engine = engine("abc");
        engine.handle(DocumentInput::LocalEdit { content: "abcd".into(), caret: 4 }).unwrap();
        engine.handle(DocumentInput::AutosaveElapsed).unwrap();
        engine.handle(DocumentInput::LocalEdit { content: "abcde".into(), caret: 5 }).unwrap();
        engine.handle(DocumentInput::SaveCompleted { revision: 1, result: Ok(()) }).unwrap();
        assert!(engine.state().dirty);
    }

    #[test]
    fn test_remote_cursor_tracked_and_evicted() {
        let mut engine = engine("abc");
        let base = Instant::now();
        let cursor = DocumentCursor {
            document_id: "doc-1".into(),
            project_id: "proj-1".into(),
            user_id: "other".into(),
            user_name: "Other".into(),
            position: 2,
            selection_start: Some(1),
            selection_end: Some(2),
            timestamp: Utc::now(),
        };
        engine.handle(DocumentInput::RemoteCursor { cursor: cursor.clone(), now: base }).unwrap();
        assert_eq!(engine.state().presence.len(), 1);

        let mut own = cursor;
        own.user_id = "me".into();
        engine.handle(DocumentInput::RemoteCursor { cursor: own, now: base }).unwrap();
        assert_eq!(engine.state().presence.len(), 1);

        engine.handle(DocumentInput::Tick(base + Duration::from_secs(11))).unwrap();
        assert!(engine.state().presence.is_empty());
    }

    #[test]
    fn test_local_cursor_broadcast() {
        let mut engine = engine("abc");
        let effects = engine
            .handle(DocumentInput::LocalCursor { position: 2, selection_start: None, selection_end: None })
            .unwrap();
        match effects.as_slice() {
            [DocumentEffect::Broadcast(GatewayRequest::DocumentCursor(cursor))] => {
                assert_eq!(cursor.position, 2);
                assert_eq!(cursor.user_name, "Me");
            }
            other => panic!("unexpected effects {other:?}"),
        }
    }

    #[test]
    fn test_input_from_event() {
        let event = Event {
            id: "e1".into(),
            event_type: EventType::DocumentChange,
            source: "api".into(),
            payload: json!({
                "document_id": "doc-1", "user_id": "other", "user_name": "Other",
                "operation": "insert", "position": 0, "content": "Z",
                "timestamp": "2024-05-01T12:00:00"
            }),
            timestamp: Utc::now(),
        };
        let input = DocumentInput::from_event(&event, Instant::now()).unwrap();
        assert!(matches!(input, Some(DocumentInput::RemoteChange(ref c)) if c.content == "Z"));

        let job = Event { event_type: EventType::JobCreated, ..event };
        assert!(DocumentInput::from_event(&job, Instant::now()).unwrap().is_none());
    }

    #[test]
    fn test_change_wire_shape() {
        let change = remote(Operation::Delete, 3, "x");
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["operation"], "delete");
        assert_eq!(value["position"], 3);
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
