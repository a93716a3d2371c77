use actix_web::{get, web, HttpResponse, Responder};
use serde_json::json;

use crate::error::EngineError;
use crate::services::runtime::IrrigationService;

pub mod devices;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check);

    cfg.service(web::scope("/api/bus").service(bus_status));

    // Device directive routes
    cfg.service(
        web::scope("/api/devices")
            .service(devices::send_command)
            .service(devices::send_config)
            .service(devices::send_firmware),
    );
}

#[get("/")]
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "Irrigation Backend",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Transport connection snapshot
#[get("/status")]
pub async fn bus_status(service: web::Data<IrrigationService>) -> impl Responder {
    HttpResponse::Ok().json(service.bus_status())
}

pub(crate) fn error_response(err: &EngineError) -> HttpResponse {
    let body = json!({ "error": err.to_string() });
    match err {
        EngineError::NotFound(_) => HttpResponse::NotFound().json(body),
        EngineError::Validation(_) | EngineError::MalformedMessage(_) => {
            HttpResponse::BadRequest().json(body)
        }
        EngineError::Transport(_) => HttpResponse::ServiceUnavailable().json(body),
        EngineError::Persistence(_) | EngineError::Config(_) | EngineError::Scheduler(_) => {
            log::error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(json!({ "error": "internal error" }))
        }
    }
}
