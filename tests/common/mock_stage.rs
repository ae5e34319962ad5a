use std::{
    net::TcpListener,
    sync::{Arc, Mutex},
    time::Duration,
};

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, dev::ServerHandle, web};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::json;

/// What the mock saw of one request.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub content_type: String,
    pub accept: String,
    pub body: Bytes,
}

#[derive(Clone, Default)]
struct MockState {
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

/// Upstream stage service double bound on an ephemeral port.
pub struct MockStage {
    pub url: String,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    handle: ServerHandle,
}

impl MockStage {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = MockState::default();
        let seen = state.seen.clone();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/analyze", web::post().to(analyze))
                .route("/process-image/stream", web::post().to(generate_stream))
                .route("/process-image", web::post().to(generate_image))
                .route("/busy", web::post().to(busy))
                .route("/slow", web::post().to(slow))
                .route("/truncated", web::post().to(truncated))
        })
        .workers(1)
        .listen(listener)
        .unwrap()
        .run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        MockStage {
            url: format!("http://127.0.0.1:{}", port),
            seen,
            handle,
        }
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub async fn stop(self) {
        self.handle.stop(false).await;
    }
}

fn record(state: &MockState, req: &HttpRequest, body: Bytes) {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    state.seen.lock().unwrap().push(SeenRequest {
        path: req.path().to_string(),
        content_type: header("content-type"),
        accept: header("accept"),
        body,
    });
}

async fn analyze(req: HttpRequest, body: Bytes, state: web::Data<MockState>) -> HttpResponse {
    record(&state, &req, body);
    HttpResponse::Ok().json(super::analysis_result(super::two_products()))
}

/// SSE cut at awkward places: inside a JSON body and between the two
/// newlines of a delimiter.
async fn generate_stream(
    req: HttpRequest,
    body: Bytes,
    state: web::Data<MockState>,
) -> HttpResponse {
    record(&state, &req, body);
    let wire: Vec<u8> = super::generation_stream("QUJDRA==")
        .iter()
        .flat_map(|f| f.to_vec())
        .collect();
    let chunks: Vec<Bytes> = wire.chunks(7).map(Bytes::copy_from_slice).collect();
    let body = stream::iter(chunks).then(|chunk| async move {
        actix_web::rt::time::sleep(Duration::from_millis(1)).await;
        Ok::<_, actix_web::Error>(chunk)
    });
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .streaming(body)
}

async fn generate_image(
    req: HttpRequest,
    body: Bytes,
    state: web::Data<MockState>,
) -> HttpResponse {
    record(&state, &req, body);
    HttpResponse::Ok()
        .content_type("image/png")
        .body(Bytes::from_static(super::PNG))
}

async fn busy(req: HttpRequest, body: Bytes, state: web::Data<MockState>) -> HttpResponse {
    record(&state, &req, body);
    HttpResponse::ServiceUnavailable().json(json!({"detail": "model overloaded"}))
}

async fn slow(req: HttpRequest, body: Bytes, state: web::Data<MockState>) -> HttpResponse {
    record(&state, &req, body);
    actix_web::rt::time::sleep(Duration::from_secs(5)).await;
    HttpResponse::Ok().json(json!({"late": true}))
}

/// Sends `completed` and then closes before the data event.
async fn truncated(req: HttpRequest, body: Bytes, state: web::Data<MockState>) -> HttpResponse {
    record(&state, &req, body);
    let frames = super::sse_frames(&[
        json!({"status": "processing", "message": "Generating"}),
        json!({"status": "completed", "message": "Image generated"}),
    ]);
    let body = stream::iter(frames.into_iter().map(Ok::<_, actix_web::Error>));
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .streaming(body)
}
