/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! The control-plane HTTP surface.
//!
//! Every request turns into exactly one `ControlMessage` pushed onto the
//! outbound ring and waits on a `oneshot` for the matching `DataMessage`
//! the data-plane loop eventually pushes back. A background task is the
//! ring's only reader; it exists purely to wake whichever request is
//! currently waiting; since only one generation request is ever
//! outstanding at a time, one pending slot is enough.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use engine::messages::{ControlMessage, DataMessage, GenerationConfig, StartGenerationOutcome};
use engine::ring;
use serde_json::{json, Value};
use tokio::sync::oneshot;

struct AppState {
    control_tx: Mutex<ring::Producer<ControlMessage>>,
    pending: Mutex<Option<oneshot::Sender<DataMessage>>>,
}

/// Polls the inbound ring and wakes whichever request is waiting. Runs for
/// the lifetime of the process on the control-plane's tokio runtime.
async fn pump_data_ring(data_rx: ring::Consumer<DataMessage>, state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(1));
    loop {
        ticker.tick().await;
        if let Some(msg) = data_rx.pop() {
            if let Some(sender) = state.pending.lock().unwrap().take() {
                let _ = sender.send(msg);
            }
        }
    }
}

/// Pushes `msg` and waits for the data plane's answer. `None` means the
/// ring was full or the data plane never answered; callers turn that into
/// a 500.
async fn send_and_await(state: &AppState, msg: ControlMessage) -> Option<DataMessage> {
    let (tx, rx) = oneshot::channel();
    *state.pending.lock().unwrap() = Some(tx);

    if state.control_tx.lock().unwrap().push(msg).is_err() {
        state.pending.lock().unwrap().take();
        return None;
    }

    rx.await.ok()
}

async fn handle_start_gen(
    State(state): State<Arc<AppState>>,
    Json(cfg): Json<GenerationConfig>,
) -> (StatusCode, Json<Value>) {
    match send_and_await(&state, ControlMessage::StartGeneration(cfg)).await {
        Some(DataMessage::StartGenerationResult(StartGenerationOutcome::Started)) => {
            (StatusCode::OK, Json(json!({"result": "Generation started"})))
        }
        Some(DataMessage::StartGenerationResult(StartGenerationOutcome::AlreadyStarted)) => {
            (StatusCode::PRECONDITION_FAILED, Json(json!({"result": "Already started"})))
        }
        Some(DataMessage::StartGenerationResult(StartGenerationOutcome::Invalid(reason))) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"result": format!("Invalid generation configuration: {reason}")})),
        ),
        Some(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"result": "unexpected response from data plane"})),
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"result": "Failed to enqueue request"})),
        ),
    }
}

async fn handle_stop_gen(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match send_and_await(&state, ControlMessage::StopGeneration).await {
        Some(DataMessage::StopGenerationResult(stats, detailed)) => (
            StatusCode::OK,
            Json(json!({"result": stats, "detailed": detailed})),
        ),
        Some(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"result": "unexpected response from data plane"})),
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"result": "Failed to enqueue request"})),
        ),
    }
}

async fn handle_get_stats(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match send_and_await(&state, ControlMessage::StatsRequest).await {
        Some(DataMessage::StatsReport(stats)) => (StatusCode::OK, Json(json!({"result": stats}))),
        Some(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"result": "unexpected response from data plane"})),
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"result": "Failed to enqueue request"})),
        ),
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start_gen", post(handle_start_gen))
        .route("/stop_gen", post(handle_stop_gen))
        .route("/get_stats", get(handle_get_stats))
        .with_state(state)
}

/// Binds `addr` and serves the control API until the process exits. Spawns
/// the ring-pump task on the same runtime.
pub async fn run_server(
    addr: SocketAddr,
    control_tx: ring::Producer<ControlMessage>,
    data_rx: ring::Consumer<DataMessage>,
) -> std::io::Result<()> {
    let state = Arc::new(AppState {
        control_tx: Mutex::new(control_tx),
        pending: Mutex::new(None),
    });

    tokio::spawn(pump_data_ring(data_rx, state.clone()));

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("control API listening on {addr}");
    axum::serve(listener, router).await
}
