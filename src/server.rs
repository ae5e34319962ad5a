use crate::error::PipelineError;
use crate::io_struct::{PipelineKind, PipelineReqInput};
use crate::state::{AppState, OrchestratorConfig};
use actix_web::{HttpRequest, HttpResponse, HttpServer, get, post, web};
use serde_json::json;
use std::io::Write;

/// Room left in the JSON body for the fields around the base64 image.
const BODY_OVERHEAD: usize = 64 * 1024;

#[get("/health")]
pub async fn health(_req: HttpRequest, _: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "healthy", "service": "stage-orchestrator"}))
}

#[get("/metrics")]
pub async fn metrics(_req: HttpRequest, app_state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(app_state.stats.to_json())
}

#[post("/design")]
pub async fn design(
    _req: HttpRequest,
    req: web::Json<PipelineReqInput>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PipelineError> {
    app_state
        .run_buffered(PipelineKind::Design, req.into_inner())
        .await
}

#[post("/design/stream")]
pub async fn design_stream(
    _req: HttpRequest,
    req: web::Json<PipelineReqInput>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PipelineError> {
    app_state.run_streaming(PipelineKind::Design, req.into_inner())
}

#[post("/tour")]
pub async fn tour(
    _req: HttpRequest,
    req: web::Json<PipelineReqInput>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PipelineError> {
    app_state
        .run_buffered(PipelineKind::Tour, req.into_inner())
        .await
}

#[post("/tour/stream")]
pub async fn tour_stream(
    _req: HttpRequest,
    req: web::Json<PipelineReqInput>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, PipelineError> {
    app_state.run_streaming(PipelineKind::Tour, req.into_inner())
}

/// Body limit sized for a base64 image of `max_upload_bytes`. Malformed bodies
/// answer 400 with the usual `{"error": ...}` shape.
pub fn json_config(max_upload_bytes: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(max_upload_bytes.div_ceil(3) * 4 + BODY_OVERHEAD)
        .error_handler(|err, _req| PipelineError::InputValidation(err.to_string()).into())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(metrics)
        .service(design)
        .service(design_stream)
        .service(tour)
        .service(tour_stream);
}

pub async fn periodic_logging(app_state: AppState) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(app_state.log_interval)).await;
        log::info!("Pipeline stats: {}", app_state.stats);
    }
}

pub fn init_logging(level: &str) {
    let level = level.parse().unwrap_or(log::LevelFilter::Info);
    let result = env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .parse_default_env()
        .try_init();
    if let Err(e) = result {
        eprintln!("Logger already initialized: {}", e);
    }
}

pub async fn startup(config: OrchestratorConfig, app_state: AppState) -> std::io::Result<()> {
    let max_upload_bytes = app_state.max_upload_bytes;
    let app_state = web::Data::new(app_state);

    log::info!("Starting server at {}:{}", config.host, config.port);

    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .app_data(json_config(max_upload_bytes))
            .configure(configure)
    })
    .bind((config.host, config.port))?
    .run()
    .await?;

    std::io::Result::Ok(())
}
