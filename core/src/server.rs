//! HTTP and WebSocket surface.

use std::convert::Infallible;
use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use slog::{debug, info, warn, Logger};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::analysis::{rhythm, Parameters};
use crate::error::CoreError;
use crate::router::observer::ObserverLink;
use crate::router::ObserverEvent;
use crate::sessions::StartSession;
use crate::HwCore;

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    session_ids: Vec<String>,
}

fn with_core(core: Arc<HwCore>) -> impl Filter<Extract = (Arc<HwCore>,), Error = Infallible> + Clone {
    warp::any().map(move || core.clone())
}

pub fn routes(core: Arc<HwCore>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let device = warp::path("device")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_core(core.clone()))
        .map(|ws: Ws, core: Arc<HwCore>| ws.on_upgrade(move |socket| device_socket(socket, core)));

    let observer = warp::path("observer")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_core(core.clone()))
        .map(|ws: Ws, core: Arc<HwCore>| ws.on_upgrade(move |socket| observer_socket(socket, core)));

    let analyze = warp::path!("analysis" / "hybrid" / String)
        .and(warp::post())
        .and(with_core(core.clone()))
        .and_then(analyze_session);

    let batch = warp::path!("analysis" / "batch")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_core(core.clone()))
        .and_then(analyze_batch);

    let start_session = warp::path!("sessions")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_core(core.clone()))
        .and_then(start_session);

    let stop_session = warp::path!("sessions" / String / "stop")
        .and(warp::post())
        .and(with_core(core.clone()))
        .and_then(stop_session);

    let devices = warp::path!("devices")
        .and(warp::get())
        .and(with_core(core.clone()))
        .map(|core: Arc<HwCore>| warp::reply::json(&core.gateway.devices()));

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_core(core.clone()))
        .map(|core: Arc<HwCore>| {
            warp::reply::json(&json!({
                "status": "healthy",
                "service": "hwcore",
                "timestamp": Utc::now(),
                "externalClassifier": core.orchestrator.has_classifier(),
            }))
        });

    let models = warp::path!("models")
        .and(warp::get())
        .and(with_core(core))
        .map(|core: Arc<HwCore>| warp::reply::json(&models(&core)));

    device
        .or(observer)
        .or(analyze)
        .or(batch)
        .or(start_session)
        .or(stop_session)
        .or(devices)
        .or(health)
        .or(models)
        .recover(handle_rejection)
}

pub async fn serve(core: Arc<HwCore>) {
    let addr = core.config.bind_addr;
    info!(core.logger(), "listening"; "addr" => %addr);
    warp::serve(routes(core)).run(addr).await;
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::MalformedMessage(_) | CoreError::InvalidBatch(_) => StatusCode::BAD_REQUEST,
        CoreError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::DeviceNotConnected(_) => StatusCode::CONFLICT,
        CoreError::Timeout(_) | CoreError::Classifier(_) | CoreError::Http(_) => StatusCode::BAD_GATEWAY,
        CoreError::Storage(_) | CoreError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &CoreError) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&json!({ "error": err.to_string() })), status_for(err)).into_response()
}

async fn analyze_session(session_id: String, core: Arc<HwCore>) -> Result<warp::reply::Response, Infallible> {
    Ok(match core.orchestrator.analyze_session(&session_id).await {
        Ok(report) => warp::reply::json(&report).into_response(),
        Err(e) => {
            warn!(core.logger(), "analysis failed"; "session_id" => &session_id, "error" => %e);
            error_response(&e)
        }
    })
}

async fn analyze_batch(request: BatchRequest, core: Arc<HwCore>) -> Result<warp::reply::Response, Infallible> {
    if request.session_ids.is_empty() {
        return Ok(error_response(&CoreError::MalformedMessage("sessionIds must not be empty".to_string())));
    }
    let results = core.orchestrator.analyze_batch(&request.session_ids).await;
    Ok(warp::reply::json(&json!({
        "count": results.len(),
        "results": results,
        "timestamp": Utc::now(),
    }))
    .into_response())
}

async fn start_session(request: StartSession, core: Arc<HwCore>) -> Result<warp::reply::Response, Infallible> {
    Ok(match core.sessions.start_session(request).await {
        Ok(outcome) => warp::reply::with_status(warp::reply::json(&outcome), StatusCode::CREATED).into_response(),
        Err(e) => error_response(&e),
    })
}

async fn stop_session(session_id: String, core: Arc<HwCore>) -> Result<warp::reply::Response, Infallible> {
    Ok(match core.sessions.stop_session(&session_id).await {
        Ok(outcome) => warp::reply::json(&outcome).into_response(),
        Err(e) => error_response(&e),
    })
}

fn models(core: &HwCore) -> serde_json::Value {
    let params = Parameters::for_rate(core.config.default_sample_rate);
    let rules: Vec<&str> = rhythm::RULES.iter().map(|rule| rule.name).collect();
    json!({
        "models": [{
            "name": "rule-based",
            "detector": "pan-tompkins",
            "parameters": {
                "samplingFrequency": params.sampling_frequency,
                "bandpassHz": [params.bandpass_frequencies.0, params.bandpass_frequencies.1],
                "integrationWindowMs": params.integration_window_ms,
                "thresholdRatio": params.threshold_ratio,
                "refractoryMs": params.refractory_ms,
                "minSamples": params.min_samples,
            },
            "rules": rules,
        }],
        "externalClassifier": core.config.classifier_url,
    })
}

async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        (StatusCode::BAD_REQUEST, format!("{err:?}"))
    };
    Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status).into_response())
}

type WsSink = futures::stream::SplitSink<WebSocket, Message>;

fn text_frame<T: serde::Serialize>(message: &T, logger: &Logger) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Message::text(text)),
        Err(e) => {
            warn!(logger, "dropping unserializable message"; "error" => %e);
            None
        }
    }
}

/// Serializes each queued message into a text frame until the queue or the socket closes.
fn spawn_writer<T: serde::Serialize + Send + 'static>(
    mut sink: WsSink,
    queue: mpsc::UnboundedReceiver<T>,
    logger: Logger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut queue = UnboundedReceiverStream::new(queue);
        while let Some(message) = queue.next().await {
            let Some(frame) = text_frame(&message, &logger) else { continue };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Writes the observer's own bounded queue and the shared device updates to
/// its socket. While the socket is stalled both sources drop rather than grow.
fn spawn_observer_writer(
    mut sink: WsSink,
    mut own: mpsc::Receiver<ObserverEvent>,
    mut updates: broadcast::Receiver<ObserverEvent>,
    logger: Logger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = own.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                update = updates.recv() => match update {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(logger, "observer lagged on device updates"; "count" => skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            let Some(frame) = text_frame(&event, &logger) else { continue };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    })
}

async fn device_socket(socket: WebSocket, core: Arc<HwCore>) {
    let gateway = core.gateway.clone();
    let (ws_tx, mut ws_rx) = socket.split();
    let (mut link, outbound) = gateway.open();
    let logger = core.logger().new(slog::o!("connection" => link.connection_id.to_string()));
    let writer = spawn_writer(ws_tx, outbound, logger.clone());

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(msg) if msg.is_close() => break,
            Ok(msg) => match msg.to_str() {
                Ok(text) => gateway.handle_text(&mut link, text).await,
                Err(()) => debug!(logger, "ignoring non-text frame"),
            },
            Err(e) => {
                warn!(logger, "device transport error"; "error" => %e);
                break;
            }
        }
    }

    gateway.disconnect(&mut link).await;
    drop(link);
    writer.abort();
}

async fn observer_socket(socket: WebSocket, core: Arc<HwCore>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (mut link, outbound) = ObserverLink::new();
    let logger = core.logger().new(slog::o!("observer" => link.id.to_string()));

    let writer = spawn_observer_writer(ws_tx, outbound, core.router.subscribe_updates(), logger.clone());
    info!(logger, "observer connected");

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(msg) if msg.is_close() => break,
            Ok(msg) => match msg.to_str() {
                Ok(text) => link.handle_text(text, &core.router, &core.sessions, &logger).await,
                Err(()) => debug!(logger, "ignoring non-text frame"),
            },
            Err(e) => {
                warn!(logger, "observer transport error"; "error" => %e);
                break;
            }
        }
    }

    link.close(&core.router);
    writer.abort();
    info!(logger, "observer disconnected");
}
