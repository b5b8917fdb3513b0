use anyhow::Result;
use huddle_client::dispatch::{observer_fn, Dispatcher};
use huddle_client::media::ObserverEngine;
use huddle_client::network::{ApiClient, ApiRequest, WebSocketConnector};
use huddle_client::room::JoinParams;
use huddle_client::{ClientSettings, RoomClient, RoomEvent};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_file = std::env::args().nth(1);
    let settings = ClientSettings::load(config_file.as_deref())?;

    tracing::info!(
        host = %settings.host,
        port = settings.port,
        room_id = %settings.room_id,
        "Starting Huddle observer..."
    );

    if let Some(api) = ApiClient::from_settings(&settings.api) {
        let path = format!("/rooms/{}", urlencoding::encode(&settings.room_id));
        match api.send(ApiRequest::get("api", path)).await {
            Ok(room) => tracing::info!(room = %room, "Room details"),
            Err(e) => tracing::warn!("Failed to fetch room details: {}", e),
        }
    }

    let connector = Arc::new(WebSocketConnector::new(settings.signaling.ping_interval()));
    let room = RoomClient::new(
        Arc::new(ObserverEngine::new()),
        connector,
        settings.signaling.clone(),
    );

    let ui = Dispatcher::spawn("events");
    room.subscribe(observer_fn(log_event), &ui);

    // The observer engine has no media transports to offer
    let mut params = JoinParams::from_settings(&settings);
    params.options.produce = false;
    params.options.consume = false;
    room.join_with(params);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    room.leave();
    ui.flush().await;

    Ok(())
}

fn log_event(event: &RoomEvent) {
    match event {
        RoomEvent::RoomStateChanged(state) => tracing::info!(%state, "Room state changed"),
        RoomEvent::ParticipantJoined(p) => tracing::info!(
            peer_id = %p.peer_id,
            display_name = %p.display_name,
            "Participant joined"
        ),
        RoomEvent::ParticipantLeft { peer_id } => tracing::info!(%peer_id, "Participant left"),
        RoomEvent::DisplayNameChanged {
            peer_id,
            display_name,
            old_display_name,
        } => tracing::info!(%peer_id, %old_display_name, %display_name, "Display name changed"),
        RoomEvent::ActiveSpeaker { peer_id, volume } => {
            tracing::debug!(peer_id = peer_id.as_deref().unwrap_or("-"), ?volume, "Active speaker")
        }
        other => tracing::debug!(event = ?other, "Room event"),
    }
}
