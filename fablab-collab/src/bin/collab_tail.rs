//! Tail the event broker: connect as `COLLAB_USER_ID` and log every event.
//!
//! Extra event types to subscribe to can be passed as arguments:
//! `collab-tail printer_jam filament_low`

use fablab_collab::{CollabConfig, CollabError, ConnectionState, EventStreamClient, Topic};

#[tokio::main]
async fn main() -> Result<(), CollabError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CollabConfig::from_env()?;
    let user_id = std::env::var("COLLAB_USER_ID").map_err(|_| CollabError::NotAuthenticated)?;
    let mut extra: Vec<String> = std::env::args().skip(1).collect();

    let client = EventStreamClient::new(&config);
    client.authenticate(user_id);
    let tail = client.add_event_listener(Topic::All, |event| {
        log::info!(
            "[{}] {} from {:?}: {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.event_type,
            event.source,
            event.payload
        );
        Ok(())
    });

    let mut state = client.watch_state();
    if let Err(e) = client.connect().await {
        log::warn!("Initial connect failed ({e}); retrying every {:?}", config.reconnect_interval);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let result = loop {
        if !extra.is_empty() && client.subscribe(extra.iter().cloned()) {
            log::info!("Subscribed to {}", extra.join(", "));
            extra.clear();
        }
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            changed = state.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = *state.borrow_and_update();
                log::debug!("Connection state: {current:?}");
                if current == ConnectionState::Error {
                    break Err(CollabError::Connection(format!(
                        "gave up after {} reconnect attempts",
                        config.max_reconnect_attempts
                    )));
                }
            }
        }
    };

    tail.unregister();
    client.disconnect();
    result
}
