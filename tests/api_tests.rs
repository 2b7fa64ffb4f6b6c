use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, test, web};
use gpoll::backend::MockGpioBackend;
use gpoll::config::AppConfig;
use gpoll::gpio::LineBackend;
use gpoll::routes::AppState;
use serde_json::Value;

fn sample_config() -> AppConfig {
    AppConfig::from_json(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1",
                "timeout": 30
            },
            "lines": {
                "1": {
                    "name": "DOOR",
                    "chip": "/dev/gpiochip0",
                    "line": 2
                },
                "2": {
                    "name": "BUTTON 1",
                    "chip": "/dev/gpiochip0",
                    "line": 3,
                    "bias": "pull-up"
                },
                "42": {
                    "name": "General IO 1",
                    "chip": "/dev/gpiochip1",
                    "line": 5,
                    "bias": "pull-down"
                }
            },
            "poll_interval_ms": 5,
            "event_history_capacity": 32
        }
        "#,
    )
    .expect("valid sample config")
}

#[actix_rt::test]
async fn list_lines_returns_all() {
    let cfg = Arc::new(sample_config());
    let backend: Arc<dyn LineBackend> = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), backend);
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;
    let req = test::TestRequest::get().uri("/api/v1/lines").to_request();
    let response: HashMap<String, Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response.len(), 3);
    assert!(response.contains_key("42"));

    let button = response.get("2").unwrap();
    assert_eq!(button["registered"], false);
    let cfg = &button["info"];
    assert_eq!(cfg["name"], "BUTTON 1");
    assert_eq!(cfg["chip"], "/dev/gpiochip0");
    assert_eq!(cfg["line"], 3);
    assert_eq!(cfg["bias"], "pull-up");
}

#[actix_rt::test]
async fn line_not_found_returns_404() {
    let cfg = Arc::new(sample_config());
    let backend: Arc<dyn LineBackend> = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), backend);
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;
    let req = test::TestRequest::get().uri("/api/v1/line/999").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/999/edge")
        .set_payload(r#"{"edge":"rising"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let cfg = Arc::new(sample_config());
    let backend: Arc<dyn LineBackend> = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), backend);
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post().uri("/api/v1/line/1").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::get()
        .uri("/api/v1/controller/start")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn register_before_start_is_conflict() {
    let cfg = Arc::new(sample_config());
    let backend: Arc<dyn LineBackend> = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), backend);
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/line/1/edge")
        .set_payload(r#"{"edge":"rising"}"#)
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["error"], "GPIO is not yet open");

    let req = test::TestRequest::post()
        .uri("/api/v1/controller/start")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/line/1/edge")
        .set_payload(r#"{"edge":"rising"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
}

#[actix_rt::test]
async fn lifecycle_and_registration_happy_path() {
    let cfg = Arc::new(sample_config());
    let backend: Arc<dyn LineBackend> = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), backend);
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    for step in ["start", "poll"] {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/controller/{step}"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    let req = test::TestRequest::post()
        .uri("/api/v1/line/1/edge")
        .set_payload(r#"{"edge":"both"}"#)
        .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["open"], true);
    assert_eq!(status["polling"], true);
    assert_eq!(status["lines"], serde_json::json!([1]));

    let req = test::TestRequest::post()
        .uri("/api/v1/line/1/edge")
        .set_payload(r#"{"edge":"rising"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::get().uri("/api/v1/line/1").to_request();
    let line: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(line["registered"], true);

    let req = test::TestRequest::delete()
        .uri("/api/v1/line/1/edge")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::delete()
        .uri("/api/v1/line/1/edge")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri("/api/v1/controller/stop")
        .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["open"], false);
    assert_eq!(status["polling"], false);
}

#[actix_rt::test]
async fn detected_edges_are_recorded() {
    let cfg = Arc::new(sample_config());
    let mock = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), mock.clone());
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    for step in ["start", "poll"] {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/controller/{step}"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    let req = test::TestRequest::post()
        .uri("/api/v1/line/2/edge")
        .set_payload(r#"{"edge":"falling"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // no event before the line ever changes
    let req = test::TestRequest::get()
        .uri("/api/v1/line/2/event")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert!(body.is_empty());

    mock.set_level(2, 1);
    mock.set_level(2, 0);

    let mut last = Value::Null;
    for _ in 0..200 {
        let req = test::TestRequest::get()
            .uri("/api/v1/line/2/event")
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        if !body.is_empty() {
            last = serde_json::from_slice(&body).unwrap();
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last["line_id"], 2);
    assert_eq!(last["edge"], "falling");

    let req = test::TestRequest::get()
        .uri("/api/v1/line/2/events?limit=5")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(events.len(), 1);

    let req = test::TestRequest::post()
        .uri("/api/v1/controller/stop")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert!(!mock.is_open());
}

#[actix_rt::test]
async fn interval_is_gated_on_open() {
    let cfg = Arc::new(sample_config());
    let backend: Arc<dyn LineBackend> = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), backend);
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/controller/interval")
        .to_request();
    let interval: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(interval["interval_ms"], 5);

    let req = test::TestRequest::post()
        .uri("/api/v1/controller/interval")
        .set_payload(r#"{"interval_ms":25}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::post()
        .uri("/api/v1/controller/start")
        .to_request();
    test::call_service(&app, req).await;

    // accepted while open even though nothing is polling yet
    let req = test::TestRequest::post()
        .uri("/api/v1/controller/interval")
        .set_payload(r#"{"interval_ms":25}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/controller/interval")
        .set_payload(r#"{"interval_ms":0}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::get().uri("/api/v1/controller").to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["interval_ms"], 25);
    assert_eq!(status["polling"], false);
}

#[actix_rt::test]
async fn reject_invalid_edge_payloads() {
    let cfg = Arc::new(sample_config());
    let backend: Arc<dyn LineBackend> = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), backend);
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    for payload in ["", r#"{"edge":"sideways"}"#, r#"{"edge":"none"}"#] {
        let req = test::TestRequest::post()
            .uri("/api/v1/line/1/edge")
            .set_payload(payload)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "payload {payload:?}");
    }

    let req = test::TestRequest::get().uri("/api/v1/line/x1").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn read_value_requires_open_device() {
    let cfg = Arc::new(sample_config());
    let mock = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), mock.clone());
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/line/42/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::post()
        .uri("/api/v1/controller/start")
        .to_request();
    test::call_service(&app, req).await;
    mock.set_level(42, 1);

    let req = test::TestRequest::get()
        .uri("/api/v1/line/42/value")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");
}

#[actix_rt::test]
async fn event_stream_requires_websocket_upgrade() {
    let cfg = Arc::new(sample_config());
    let backend: Arc<dyn LineBackend> = Arc::new(MockGpioBackend::default());
    let state = AppState::new(cfg.clone(), backend);
    let scope_path = cfg.http.path.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/lines/events")
        .insert_header(("upgrade", "websocket"))
        .insert_header(("connection", "upgrade"))
        .insert_header(("sec-websocket-version", "13"))
        .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 101);

    let req = test::TestRequest::get()
        .uri("/api/v1/lines/events")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::get()
        .uri("/api/v1/line/999/events/ws")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}
