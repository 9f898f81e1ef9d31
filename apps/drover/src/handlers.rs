use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use crate::dispatcher::{DispatchReceipt, PendingView};
use crate::error::ControlError;
use crate::fsnav::EntryView;
use crate::protocol::ControllerEvent;
use crate::registry::{SessionView, Target};
use crate::stream::StreamStatusView;
use crate::websocket::ControllerState;

fn error_response(err: ControlError) -> Response {
    let status = match &err {
        ControlError::TargetNotLive(_) | ControlError::UnknownSender(_) => StatusCode::NOT_FOUND,
        ControlError::MissingIdentifier | ControlError::MalformedPayload(_) => {
            StatusCode::BAD_REQUEST
        }
        ControlError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
pub struct LiveDevice {
    #[serde(flatten)]
    pub session: SessionView,
    pub tag: Option<String>,
}

/// Currently connected agents, including not-yet-registered placeholders.
pub async fn list_live_devices(State(state): State<ControllerState>) -> impl IntoResponse {
    let devices: Vec<LiveDevice> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|session| {
            let tag = session
                .device_id
                .as_deref()
                .and_then(|id| state.tags.get(id));
            LiveDevice { session, tag }
        })
        .collect();
    Json(devices)
}

#[derive(Debug, Serialize)]
pub struct StoredDevice {
    pub device_id: String,
    pub tag: Option<String>,
}

/// Devices that have ever sent data, independent of live state.
pub async fn list_stored_devices(State(state): State<ControllerState>) -> Response {
    match state.catalog.list() {
        Ok(devices) => {
            let devices: Vec<StoredDevice> = devices
                .into_iter()
                .map(|device_id| {
                    let tag = state.tags.get(&device_id);
                    StoredDevice { device_id, tag }
                })
                .collect();
            Json(devices).into_response()
        }
        Err(err) => {
            error!(%err, "failed to enumerate stored devices");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "catalog unavailable" })),
            )
                .into_response()
        }
    }
}

pub async fn list_commands(State(state): State<ControllerState>) -> Json<Vec<PendingView>> {
    Json(state.dispatcher.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub operation: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub receipt: DispatchReceipt,
}

/// Send a named operation to a device. The most common failure is the device
/// simply not being live; that comes back as 404, not as a retry.
pub async fn dispatch_command(
    Path(device_id): Path<String>,
    State(state): State<ControllerState>,
    Json(request): Json<DispatchRequest>,
) -> Response {
    if request.operation.trim().is_empty() {
        return error_response(ControlError::MalformedPayload(
            "operation name must not be empty".into(),
        ));
    }
    let args = if request.args.is_null() {
        json!({})
    } else {
        request.args
    };
    match state
        .dispatcher
        .dispatch(&Target::Device(device_id), &request.operation, args)
    {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(DispatchResponse {
                status: "sent",
                receipt,
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn start_stream(
    Path(device_id): Path<String>,
    State(state): State<ControllerState>,
) -> Response {
    match state.streams.start(&device_id) {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(DispatchResponse {
                status: "sent",
                receipt,
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn stop_stream(
    Path(device_id): Path<String>,
    State(state): State<ControllerState>,
) -> Response {
    match state.streams.stop(&device_id) {
        Ok(Some(receipt)) => (
            StatusCode::ACCEPTED,
            Json(DispatchResponse {
                status: "sent",
                receipt,
            }),
        )
            .into_response(),
        Ok(None) => Json(json!({ "status": "idle" })).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn stream_status(
    Path(device_id): Path<String>,
    State(state): State<ControllerState>,
) -> Json<StreamStatusView> {
    Json(state.streams.status(&device_id))
}

#[derive(Debug, Deserialize)]
pub struct ListPathRequest {
    #[serde(default)]
    pub path: String,
}

pub async fn request_listing(
    Path(device_id): Path<String>,
    State(state): State<ControllerState>,
    Json(request): Json<ListPathRequest>,
) -> Response {
    match state.navigator.request(&device_id, &request.path) {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(DispatchResponse {
                status: "sent",
                receipt,
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn go_up(
    Path(device_id): Path<String>,
    State(state): State<ControllerState>,
) -> Response {
    match state.navigator.go_up(&device_id) {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(DispatchResponse {
                status: "sent",
                receipt,
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
pub struct ListingResponse {
    pub path: String,
    pub entries: Vec<EntryView>,
}

/// Whatever was last successfully shown for this device.
pub async fn current_listing(
    Path(device_id): Path<String>,
    State(state): State<ControllerState>,
) -> Json<ListingResponse> {
    Json(ListingResponse {
        path: state.navigator.current_path(&device_id),
        entries: state.navigator.listing(&device_id),
    })
}

#[derive(Debug, Deserialize)]
pub struct TagRequest {
    pub tag: String,
}

pub async fn get_tag(
    Path(device_id): Path<String>,
    State(state): State<ControllerState>,
) -> Json<Value> {
    let tag = state.tags.get(&device_id);
    Json(json!({ "device_id": device_id, "tag": tag }))
}

pub async fn put_tag(
    Path(device_id): Path<String>,
    State(state): State<ControllerState>,
    Json(request): Json<TagRequest>,
) -> Json<Value> {
    state.tags.set(&device_id, &request.tag);
    let _ = state.events.send(ControllerEvent::TagUpdated {
        device_id: device_id.clone(),
        tag: request.tag.trim().to_string(),
    });
    Json(json!({ "device_id": device_id, "tag": request.tag.trim() }))
}
