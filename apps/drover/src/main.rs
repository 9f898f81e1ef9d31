mod catalog;
mod cli;
mod config;
mod dispatcher;
mod error;
mod fsnav;
mod handlers;
mod protocol;
mod registry;
mod stream;
mod tags;
mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    catalog::StoredDeviceCatalog,
    cli::Cli,
    config::Config,
    dispatcher::CommandDispatcher,
    fsnav::RemoteFsNavigator,
    handlers::{
        current_listing, dispatch_command, get_tag, go_up, health_check, list_commands,
        list_live_devices, list_stored_devices, put_tag, request_listing, start_stream,
        stop_stream, stream_status,
    },
    registry::SessionRegistry,
    stream::{FsChunkSink, StreamSessionManager},
    tags::DeviceTagStore,
    websocket::{agent_ws_handler, observer_ws_handler, ControllerState},
};

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);
    info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        command_ttl = config.command_ttl_seconds,
        "starting drover controller"
    );

    let catalog = match StoredDeviceCatalog::new(config.archive_dir()) {
        Ok(catalog) => Arc::new(catalog),
        Err(err) => {
            error!(%err, "failed to prepare archive directory");
            std::process::exit(1);
        }
    };
    let tags = Arc::new(DeviceTagStore::load(config.tags_file()));

    let (events, _) = broadcast::channel(256);
    let registry = Arc::new(SessionRegistry::new(events.clone()));
    let dispatcher = Arc::new(CommandDispatcher::new(registry.clone(), events.clone()));
    if config.command_ttl_seconds > 0 {
        info!(
            ttl_seconds = config.command_ttl_seconds,
            "pending-command ttl sweep enabled"
        );
        dispatcher
            .clone()
            .spawn_ttl_sweeper(Duration::from_secs(config.command_ttl_seconds));
    }
    let sink = Arc::new(FsChunkSink::new(config.streams_dir()));
    let streams = Arc::new(StreamSessionManager::new(
        registry.clone(),
        dispatcher.clone(),
        sink,
        events.clone(),
    ));
    let navigator = Arc::new(RemoteFsNavigator::new(dispatcher.clone(), events.clone()));

    let state = ControllerState {
        registry,
        dispatcher,
        streams,
        navigator,
        catalog,
        tags,
        events,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/devices/live", get(list_live_devices))
        .route("/devices/stored", get(list_stored_devices))
        .route("/commands", get(list_commands))
        .route("/devices/:id/commands", post(dispatch_command))
        .route("/devices/:id/stream", get(stream_status))
        .route("/devices/:id/stream/start", post(start_stream))
        .route("/devices/:id/stream/stop", post(stop_stream))
        .route("/devices/:id/fs", get(current_listing))
        .route("/devices/:id/fs/list", post(request_listing))
        .route("/devices/:id/fs/up", post(go_up))
        .route("/devices/:id/tag", get(get_tag).put(put_tag))
        .route("/ws/agent", get(agent_ws_handler))
        .route("/ws/observe", get(observer_ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");
    info!("drover listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
