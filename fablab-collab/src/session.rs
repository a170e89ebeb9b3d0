//! Surface sessions: the async side of the sync engines.
//!
//! A session owns one engine behind a `std::sync::Mutex` (never held across
//! an `.await`) and wires it to the outside world:
//!
//! ```text
//! EventStreamClient ── listener ──► from_event() ──► engine.handle()
//! UI call ───────────────────────────────────────► engine.handle()
//!                                                      │ effects
//!                  ┌──────────────────┬────────────────┼──────────────┐
//!                  ▼                  ▼                ▼              ▼
//!          Gateway::publish    autosave timer     Gateway::save   watch::Sender
//!          (fire-and-forget)   (debounce task)    (spawned)       (view snapshot)
//!
//! presence ticker ──► Tick(now)         connection watch ──► Connection(state)
//! ```
//!
//! Dropping a session (or calling `close`) unregisters its listeners and
//! aborts its timers. In-flight publishes and saves are left to finish.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broadcast::Gateway;
use crate::client::{ConnectionState, EventStreamClient};
use crate::config::CollabConfig;
use crate::document::{DocumentEffect, DocumentInput, DocumentRecord, DocumentState, DocumentSyncEngine};
use crate::error::CollabError;
use crate::protocol::{EventType, Identity};
use crate::registry::ListenerHandle;
use crate::whiteboard::{
    ActionKind, DisplayList, DrawingAction, Point, WhiteboardInput, WhiteboardSyncEngine, WhiteboardView,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn identity(client: &EventStreamClient, user_name: &str) -> Result<Identity, CollabError> {
    let user_id = client.user_id().ok_or(CollabError::NotAuthenticated)?;
    Ok(Identity::new(user_id, user_name))
}

fn spawn_ticker(period: Duration, on_tick: impl Fn(Instant) + Send + 'static) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            on_tick(Instant::now());
        }
    })
}

fn spawn_connection_relay(
    mut state: watch::Receiver<ConnectionState>,
    on_change: impl Fn(ConnectionState) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            on_change(current);
            if state.changed().await.is_err() {
                break;
            }
        }
    })
}

/// Listeners and background tasks owned by one session.
#[derive(Default)]
struct Wiring {
    listeners: Vec<ListenerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Wiring {
    fn shutdown(&mut self) {
        for handle in self.listeners.drain(..) {
            handle.unregister();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// =============================================================================
// DOCUMENT
// =============================================================================

struct DocumentDriver {
    engine: Mutex<DocumentSyncEngine>,
    gateway: Arc<dyn Gateway>,
    view: watch::Sender<DocumentState>,
    autosave: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentDriver {
    fn dispatch(self: &Arc<Self>, input: DocumentInput) -> Result<(), CollabError> {
        let effects = {
            let mut engine = lock(&self.engine);
            let result = engine.handle(input);
            self.view.send_replace(engine.state().clone());
            result?
        };
        for effect in effects {
            self.execute(effect);
        }
        Ok(())
    }

    fn execute(self: &Arc<Self>, effect: DocumentEffect) {
        match effect {
            DocumentEffect::Broadcast(request) => self.gateway.publish(request),
            DocumentEffect::ScheduleAutosave(delay) => {
                let driver = Arc::clone(self);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = driver.dispatch(DocumentInput::AutosaveElapsed) {
                        log::warn!("Autosave failed: {e}");
                    }
                });
                if let Some(previous) = lock(&self.autosave).replace(timer) {
                    previous.abort();
                }
            }
            DocumentEffect::CancelAutosave => {
                if let Some(timer) = lock(&self.autosave).take() {
                    timer.abort();
                }
            }
            DocumentEffect::Persist { document_id, content, revision } => {
                let driver = Arc::clone(self);
                tokio::spawn(async move {
                    log::debug!("Saving document {document_id} at revision {revision}");
                    let result = driver
                        .gateway
                        .save_document(&document_id, &content)
                        .await
                        .map_err(|e| e.to_string());
                    if let Err(e) = driver.dispatch(DocumentInput::SaveCompleted { revision, result }) {
                        log::warn!("Recording save result failed: {e}");
                    }
                });
            }
        }
    }

    fn stop(&self) {
        if let Some(timer) = lock(&self.autosave).take() {
            timer.abort();
        }
    }
}

/// An open shared document.
pub struct DocumentSession {
    driver: Arc<DocumentDriver>,
    view: watch::Receiver<DocumentState>,
    wiring: Wiring,
}

impl DocumentSession {
    /// Load `document_id` through the gateway and start syncing it.
    pub async fn open(
        client: &EventStreamClient,
        gateway: Arc<dyn Gateway>,
        document_id: &str,
        user_name: &str,
        config: &CollabConfig,
    ) -> Result<Self, CollabError> {
        let local = identity(client, user_name)?;
        let record = gateway.load_document(document_id).await?;
        Ok(Self::start(client, gateway, record, local, config))
    }

    /// Start syncing an already loaded document. Must run inside a tokio runtime.
    pub fn start(
        client: &EventStreamClient,
        gateway: Arc<dyn Gateway>,
        record: DocumentRecord,
        local: Identity,
        config: &CollabConfig,
    ) -> Self {
        log::info!("Opening document {} as {}", record.id, local.user_id);
        let engine = DocumentSyncEngine::new(record, local, config);
        let (view_tx, view) = watch::channel(engine.state().clone());
        let driver = Arc::new(DocumentDriver {
            engine: Mutex::new(engine),
            gateway,
            view: view_tx,
            autosave: Mutex::new(None),
        });

        let mut wiring = Wiring::default();
        for topic in [EventType::DocumentChange, EventType::DocumentCursor, EventType::DocumentLock] {
            let driver = Arc::clone(&driver);
            wiring.listeners.push(client.add_event_listener(topic, move |event| {
                if let Some(input) = DocumentInput::from_event(event, Instant::now())? {
                    driver.dispatch(input)?;
                }
                Ok(())
            }));
        }

        let ticking = Arc::clone(&driver);
        wiring.tasks.push(spawn_ticker(config.presence_tick, move |now| {
            // Tick never fails
            let _ = ticking.dispatch(DocumentInput::Tick(now));
        }));
        let relay = Arc::clone(&driver);
        wiring.tasks.push(spawn_connection_relay(client.watch_state(), move |state| {
            let _ = relay.dispatch(DocumentInput::Connection(state));
        }));

        Self { driver, view, wiring }
    }

    /// Feed any input to the engine and execute its effects.
    pub fn handle(&self, input: DocumentInput) -> Result<(), CollabError> {
        self.driver.dispatch(input)
    }

    /// The local buffer changed to `content`, caret now at `caret`.
    pub fn edit(&self, content: impl Into<String>, caret: usize) -> Result<(), CollabError> {
        self.handle(DocumentInput::LocalEdit { content: content.into(), caret })
    }

    pub fn move_cursor(
        &self,
        position: usize,
        selection_start: Option<usize>,
        selection_end: Option<usize>,
    ) -> Result<(), CollabError> {
        self.handle(DocumentInput::LocalCursor { position, selection_start, selection_end })
    }

    pub fn request_lock(&self) -> Result<(), CollabError> {
        self.handle(DocumentInput::RequestLock)
    }

    pub fn release_lock(&self) -> Result<(), CollabError> {
        self.handle(DocumentInput::ReleaseLock)
    }

    /// Save now, collapsing any pending autosave.
    pub fn save(&self) -> Result<(), CollabError> {
        self.handle(DocumentInput::SaveRequested)
    }

    pub fn content(&self) -> String {
        self.view.borrow().content.clone()
    }

    pub fn state(&self) -> DocumentState {
        self.view.borrow().clone()
    }

    /// Receiver notified after every state transition.
    pub fn watch(&self) -> watch::Receiver<DocumentState> {
        self.view.clone()
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.wiring.shutdown();
        self.driver.stop();
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// WHITEBOARD
// =============================================================================

struct WhiteboardDriver {
    engine: Mutex<WhiteboardSyncEngine<DisplayList>>,
    gateway: Arc<dyn Gateway>,
    view: watch::Sender<WhiteboardView>,
}

impl WhiteboardDriver {
    fn dispatch(&self, input: WhiteboardInput) {
        let requests = {
            let mut engine = lock(&self.engine);
            let requests = engine.handle(input);
            self.view.send_replace(engine.view());
            requests
        };
        for request in requests {
            self.gateway.publish(request);
        }
    }
}

/// An open project whiteboard, rendered into a [`DisplayList`].
pub struct WhiteboardSession {
    driver: Arc<WhiteboardDriver>,
    view: watch::Receiver<WhiteboardView>,
    wiring: Wiring,
}

impl WhiteboardSession {
    /// Load the project's action log through the gateway and start syncing.
    pub async fn open(
        client: &EventStreamClient,
        gateway: Arc<dyn Gateway>,
        project_id: &str,
        user_name: &str,
        config: &CollabConfig,
    ) -> Result<Self, CollabError> {
        let local = identity(client, user_name)?;
        let actions = gateway.load_whiteboard(project_id).await?;
        Ok(Self::start(client, gateway, project_id, actions, local, config))
    }

    /// Start syncing with an already loaded log. Must run inside a tokio runtime.
    pub fn start(
        client: &EventStreamClient,
        gateway: Arc<dyn Gateway>,
        project_id: &str,
        actions: Vec<DrawingAction>,
        local: Identity,
        config: &CollabConfig,
    ) -> Self {
        log::info!("Opening whiteboard {project_id} with {} actions", actions.len());
        let engine = WhiteboardSyncEngine::headless(project_id, local, actions, config.presence_ttl);
        let (view_tx, view) = watch::channel(engine.view());
        let driver = Arc::new(WhiteboardDriver { engine: Mutex::new(engine), gateway, view: view_tx });

        let mut wiring = Wiring::default();
        for topic in [EventType::WhiteboardAction, EventType::WhiteboardCursor] {
            let driver = Arc::clone(&driver);
            wiring.listeners.push(client.add_event_listener(topic, move |event| {
                if let Some(input) = WhiteboardInput::from_event(event, Instant::now())? {
                    driver.dispatch(input);
                }
                Ok(())
            }));
        }

        let ticking = Arc::clone(&driver);
        wiring.tasks.push(spawn_ticker(config.presence_tick, move |now| {
            ticking.dispatch(WhiteboardInput::Tick(now));
        }));
        let relay = Arc::clone(&driver);
        wiring.tasks.push(spawn_connection_relay(client.watch_state(), move |state| {
            relay.dispatch(WhiteboardInput::Connection(state));
        }));

        Self { driver, view, wiring }
    }

    pub fn handle(&self, input: WhiteboardInput) {
        self.driver.dispatch(input);
    }

    pub fn draw(&self, kind: ActionKind) {
        self.handle(WhiteboardInput::Local(kind));
    }

    pub fn begin_stroke(&self, erase: bool, at: Point, color: impl Into<String>, width: f64) {
        self.handle(WhiteboardInput::BeginStroke { erase, at, color: color.into(), width });
    }

    pub fn extend_stroke(&self, point: Point) {
        self.handle(WhiteboardInput::ExtendStroke(point));
    }

    pub fn end_stroke(&self) {
        self.handle(WhiteboardInput::EndStroke);
    }

    pub fn move_cursor(&self, x: f64, y: f64, tool: impl Into<String>) {
        self.handle(WhiteboardInput::LocalCursor { x, y, tool: tool.into() });
    }

    pub fn undo(&self) {
        self.handle(WhiteboardInput::Undo);
    }

    pub fn redo(&self) {
        self.handle(WhiteboardInput::Redo);
    }

    pub fn clear(&self, confirmed: bool) {
        self.handle(WhiteboardInput::Clear { confirmed });
    }

    pub fn view(&self) -> WhiteboardView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<WhiteboardView> {
        self.view.clone()
    }

    /// Run `f` against the engine (log, canvas, presence).
    pub fn with_engine<R>(&self, f: impl FnOnce(&WhiteboardSyncEngine<DisplayList>) -> R) -> R {
        f(&lock(&self.driver.engine))
    }

    pub fn close(mut self) {
        self.wiring.shutdown();
    }
}

impl Drop for WhiteboardSession {
    fn drop(&mut self) {
        self.wiring.shutdown();
    }
}
