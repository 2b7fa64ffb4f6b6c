use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::{AppConfig, EdgeKind, LineConfig, LineId};
use crate::controller::Controller;
use crate::error::AppError;
use crate::events::{EdgeEvent, EventCallbackHandler, EventHandler};
use crate::gpio::{LineBackend, LineDescriptor};

pub struct AppState<B: LineBackend + ?Sized> {
    pub config: Arc<AppConfig>,
    pub controller: Arc<Mutex<Controller<B>>>,
    pub events: EventHandler,
}

impl<B: LineBackend + ?Sized> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            controller: Arc::clone(&self.controller),
            events: Arc::clone(&self.events),
        }
    }
}

#[derive(Deserialize)]
struct EdgePayload {
    edge: EdgeKind,
}

#[derive(Deserialize, Serialize)]
struct IntervalPayload {
    interval_ms: u64,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

/// Streams edge events to one WebSocket client until either side hangs up.
async fn stream_edge_events(
    mut session: Session,
    mut client: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    line_filter: Option<LineId>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        let keep_open = tokio::select! {
            msg = client.recv() => match msg {
                Some(Ok(msg)) => answer_client(&mut session, msg).await,
                Some(Err(_)) | None => false,
            },
            event = events.next() => match event {
                Some(Ok(event)) if line_filter.is_some_and(|id| id != event.line_id) => true,
                Some(Ok(event)) => send_json(&mut session, &event).await,
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!("event subscriber lagged, {skipped} edge events skipped");
                    send_json(&mut session, &serde_json::json!({ "lagged": skipped })).await
                }
                None => false,
            },
        };

        if !keep_open {
            break;
        }
    }

    debug!("edge event stream closed");
}

async fn answer_client(session: &mut Session, msg: Message) -> bool {
    match msg {
        Message::Ping(bytes) => session.pong(&bytes).await.is_ok(),
        Message::Close(reason) => {
            let _ = session.clone().close(reason).await;
            false
        }
        _ => true,
    }
}

async fn send_json<T: Serialize>(session: &mut Session, value: &T) -> bool {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode edge event: {e}");
            return true;
        }
    };

    if session.text(text).await.is_err() {
        warn!("WebSocket client disconnected");
        return false;
    }
    true
}

impl<B: LineBackend + ?Sized + 'static> AppState<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Self {
        let controller = Controller::new(backend, config.controller_settings());
        let events = Arc::new(EventCallbackHandler::from_config(&config));

        Self {
            config,
            controller: Arc::new(Mutex::new(controller)),
            events,
        }
    }

    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/controller")
                    .route(web::get().to(controller_status::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/controller/start")
                    .route(web::post().to(controller_start::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/controller/poll")
                    .route(web::post().to(controller_poll::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/controller/stop-polling")
                    .route(web::post().to(controller_stop_polling::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/controller/stop")
                    .route(web::post().to(controller_stop::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/controller/interval")
                    .route(web::get().to(get_interval::<B>))
                    .route(web::post().to(set_interval::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET, Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/lines")
                    .route(web::get().to(list_lines::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/lines/events")
                    .route(web::get().to(events_ws_all::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/line/{line_id}")
                    .route(web::get().to(line_descriptor::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/line/{line_id}/edge")
                    .route(web::post().to(register_edge::<B>))
                    .route(web::delete().to(remove_edge::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST, Method::DELETE]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/line/{line_id}/value")
                    .route(web::get().to(get_value::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/line/{line_id}/event")
                    .route(web::get().to(get_last_event::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/line/{line_id}/events")
                    .route(web::get().to(get_events::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/line/{line_id}/events/ws")
                    .route(web::get().to(events_ws_line::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
    }

    fn line_config(&self, line_id: LineId) -> Result<&LineConfig, AppError> {
        self.config
            .lines
            .get(&line_id)
            .ok_or_else(|| AppError::NotFoundLine(line_id.to_string()))
    }
}

async fn controller_status<B: LineBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let status = state.controller.lock().await.status();

    Ok(web::Json(status))
}

async fn controller_start<B: LineBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let mut controller = state.controller.lock().await;
    controller.start();

    Ok(web::Json(controller.status()))
}

async fn controller_poll<B: LineBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let mut controller = state.controller.lock().await;
    controller.poll()?;

    Ok(web::Json(controller.status()))
}

async fn controller_stop_polling<B: LineBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let mut controller = state.controller.lock().await;
    controller.stop_polling().await;

    Ok(web::Json(controller.status()))
}

async fn controller_stop<B: LineBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let mut controller = state.controller.lock().await;
    controller.stop().await;

    Ok(web::Json(controller.status()))
}

async fn get_interval<B: LineBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let interval = state.controller.lock().await.poll_interval();

    Ok(web::Json(IntervalPayload {
        interval_ms: interval.as_millis() as u64,
    }))
}

async fn set_interval<B: LineBackend + ?Sized + 'static>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let payload: IntervalPayload = parse_json_payload(&body, "interval")?;

    state
        .controller
        .lock()
        .await
        .update_poll_freq(Duration::from_millis(payload.interval_ms))
        .await?;

    Ok(web::Json(payload))
}

async fn list_lines<B: LineBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let controller = state.controller.lock().await;
    let lines: HashMap<LineId, LineDescriptor> = state
        .config
        .lines
        .iter()
        .map(|(id, cfg)| {
            (
                *id,
                LineDescriptor {
                    info: cfg.clone(),
                    registered: controller.is_registered(*id),
                },
            )
        })
        .collect();

    Ok(web::Json(lines))
}

async fn line_descriptor<B: LineBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    let info = state.line_config(line_id)?.clone();
    let registered = state.controller.lock().await.is_registered(line_id);

    Ok(web::Json(LineDescriptor { info, registered }))
}

async fn register_edge<B: LineBackend + ?Sized + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    state.line_config(line_id)?;
    let payload: EdgePayload = parse_json_payload(&body, "edge")?;
    if payload.edge == EdgeKind::None {
        return Err(AppError::InvalidValue(
            "Edge must be rising, falling or both; use DELETE to disarm".into(),
        ));
    }

    let callback = state.events.callback_for(line_id);
    let mut controller = state.controller.lock().await;
    controller
        .register_edge_detection(line_id, payload.edge, move |edge| callback(edge))
        .await?;

    Ok(web::Json(controller.status()))
}

async fn remove_edge<B: LineBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    state.line_config(line_id)?;

    let mut controller = state.controller.lock().await;
    controller.remove_edge_detection_registration(line_id).await?;

    Ok(web::Json(controller.status()))
}

async fn get_value<B: LineBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    state.line_config(line_id)?;

    let controller = state.controller.lock().await;
    if !controller.is_open() {
        return Err(AppError::NotOpen);
    }
    let value = controller.backend().read_value(line_id)?;

    Ok(web::Json(value))
}

async fn get_last_event<B: LineBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    state.line_config(line_id)?;

    match state.events.last_event(line_id) {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn get_events<B: LineBackend + ?Sized + 'static>(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    state.line_config(line_id)?;

    Ok(web::Json(state.events.events(line_id, query.limit)))
}

async fn events_ws_all<B: LineBackend + ?Sized + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    open_event_websocket(&req, stream, &state, None)
}

async fn events_ws_line<B: LineBackend + ?Sized + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let line_id = parse_line_id(&req)?;
    state.line_config(line_id)?;

    open_event_websocket(&req, stream, &state, Some(line_id))
}

fn open_event_websocket<B: LineBackend + ?Sized + 'static>(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState<B>,
    line_filter: Option<LineId>,
) -> Result<HttpResponse, AppError> {
    let rx = state.events.subscribe();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| AppError::InvalidValue(format!("WebSocket handshake failed: {e}")))?;

    actix_web::rt::spawn(stream_edge_events(session, client_stream, rx, line_filter));

    Ok(response)
}

fn parse_json_payload<T: for<'de> Deserialize<'de>>(
    body: &[u8],
    what: &str,
) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue(format!("Empty {what} payload")));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid {what} payload: {e}")))
}

fn parse_line_id(req: &HttpRequest) -> Result<LineId, AppError> {
    let line_id = req
        .match_info()
        .get("line_id")
        .ok_or_else(|| AppError::InvalidValue("Missing line id".into()))?;
    let line_id = line_id
        .parse::<LineId>()
        .map_err(|_| AppError::InvalidValue("Invalid line id".into()))?;

    Ok(line_id)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
