mod common;

use std::{sync::Arc, time::Duration};

use actix_web::{App, http::StatusCode, test, web};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use common::{
    FakeMuxer, FakeTransport, Reply, analysis_result, generation_stream, orchestrator, two_products,
};
use serde_json::{Value, json};
use stage_orchestrator::error::StageError;
use stage_orchestrator::pipeline::Orchestrator;
use stage_orchestrator::server::{configure, json_config};
use stage_orchestrator::sse::SseDecoder;
use stage_orchestrator::stage_client::{BufferedResponse, StageId, StageMode};
use stage_orchestrator::state::AppState;

const MAX_UPLOAD: usize = 1024 * 1024;

fn design_transport() -> FakeTransport {
    FakeTransport::new()
        .reply(
            StageId::Analysis,
            Reply::Buffered(BufferedResponse::json(&analysis_result(two_products()))),
        )
        .reply(StageId::Generation, Reply::Sse(generation_stream(&"A".repeat(1234))))
}

fn body() -> Value {
    json!({
        "image": STANDARD.encode(common::PNG),
        "filename": "room.png",
        "preferences": "budget 500 scandinavian style",
        "request_id": "req_server_test",
    })
}

macro_rules! app {
    ($orchestrator:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::with_orchestrator(
                    $orchestrator,
                    MAX_UPLOAD,
                    60,
                )))
                .app_data(json_config(MAX_UPLOAD))
                .configure(configure),
        )
        .await
    };
}

#[actix_web::test]
async fn health_and_metrics() {
    let app = app!(orchestrator(
        Arc::new(FakeTransport::new()),
        Arc::new(FakeMuxer::default())
    ));

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["status"], "healthy");

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["runs"]["started"], 0);
    assert!(resp["dropped_messages"].as_object().unwrap().is_empty());
}

#[actix_web::test]
async fn design_returns_one_document() {
    let transport = Arc::new(design_transport());
    let app = app!(orchestrator(transport.clone(), Arc::new(FakeMuxer::default())));

    let req = test::TestRequest::post()
        .uri("/design")
        .set_json(body())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let doc: Value = test::read_body_json(resp).await;
    assert_eq!(doc["status"], "completed");
    assert_eq!(doc["success"], true);
    assert_eq!(doc["request_id"], "req_server_test");
    assert_eq!(doc["generated_image"]["data"].as_str().unwrap().len(), 1234);
    assert_eq!(doc["summary"]["num_recommendations"], 2);

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let metrics: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(metrics["runs"]["completed"], 1);
}

#[actix_web::test]
async fn design_stream_emits_sse() {
    let app = app!(orchestrator(
        Arc::new(design_transport()),
        Arc::new(FakeMuxer::default())
    ));

    let req = test::TestRequest::post()
        .uri("/design/stream")
        .set_json(body())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let raw = test::read_body(resp).await;
    let events: Vec<Value> = SseDecoder::new()
        .push(&raw)
        .into_iter()
        .map(|e| e.data)
        .collect();
    assert_eq!(events[0]["status"], "started");
    assert_eq!(events[0]["request_id"], "req_server_test");
    let completed = &events[events.len() - 2];
    assert_eq!(completed["status"], "completed");
    assert_eq!(completed["generated_image"]["encoded_size"], 1234);
    let data = &events[events.len() - 1];
    assert_eq!(data["status"], "image_data");
    assert_eq!(data["generated_image"]["data"].as_str().unwrap().len(), 1234);
}

#[actix_web::test]
async fn validation_errors_are_400_before_any_stage_call() {
    let transport = Arc::new(design_transport());
    let app = app!(orchestrator(transport.clone(), Arc::new(FakeMuxer::default())));

    let mut no_prefs = body();
    no_prefs["preferences"] = json!("");
    for uri in ["/design", "/design/stream"] {
        let req = test::TestRequest::post()
            .uri(uri)
            .set_json(&no_prefs)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err: Value = test::read_body_json(resp).await;
        assert!(err["error"].as_str().unwrap().contains("No preferences provided"));
        assert_eq!(err["kind"], "input_validation");
    }

    let req = test::TestRequest::post()
        .uri("/tour")
        .insert_header(("content-type", "application/json"))
        .set_payload("{\"image\": ")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert_eq!(transport.calls(StageId::Analysis), 0);
}

#[actix_web::test]
async fn stage_failures_map_to_gateway_statuses() {
    let failing = Arc::new(
        FakeTransport::new()
            .reply(
                StageId::Analysis,
                Reply::Buffered(BufferedResponse::json(&analysis_result(two_products()))),
            )
            .reply(
                StageId::Generation,
                Reply::Fail(StageError::http(StageId::Generation, 500, "boom")),
            ),
    );
    let app = app!(orchestrator(failing, Arc::new(FakeMuxer::default())));
    let req = test::TestRequest::post()
        .uri("/design")
        .set_json(body())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let err: Value = test::read_body_json(resp).await;
    assert_eq!(err["stage"], "generation");
    assert_eq!(err["kind"], "http_error");

    let slow = Arc::new(design_transport().delay(StageId::Generation, Duration::from_secs(30)));
    let mut endpoints = common::endpoints(StageMode::Streaming, Duration::from_secs(5));
    endpoints.generation.timeout = Duration::from_millis(50);
    let app = app!(Orchestrator::new(slow, Arc::new(FakeMuxer::default()), endpoints));
    let req = test::TestRequest::post()
        .uri("/design")
        .set_json(body())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[actix_web::test]
async fn in_stream_failure_is_an_error_record() {
    let app = app!(orchestrator(
        Arc::new(FakeTransport::new().reply(
            StageId::Analysis,
            Reply::Buffered(BufferedResponse::json(&analysis_result(json!([])))),
        )),
        Arc::new(FakeMuxer::default())
    ));
    let req = test::TestRequest::post()
        .uri("/design/stream")
        .set_json(body())
        .to_request();
    let resp = test::call_service(&app, req).await;
    // streaming had already started
    assert_eq!(resp.status(), StatusCode::OK);
    let raw = test::read_body(resp).await;
    let events = SseDecoder::new().push(&raw);
    let last = &events.last().unwrap().data;
    assert_eq!(last["status"], "error");
    assert!(
        last["error"]
            .as_str()
            .unwrap()
            .contains("No product recommendations found")
    );
}
