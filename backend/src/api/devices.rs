use actix_web::{post, web, HttpResponse, Responder};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use super::error_response;
use crate::bus::messages::FirmwareRelease;
use crate::services::runtime::IrrigationService;

#[derive(Deserialize)]
pub struct CommandRequest {
    pub action: String, // "pump_on", "pump_off" or any device-specific action
}

/// Publish a command to a device
#[post("/{external_id}/command")]
pub async fn send_command(
    service: web::Data<IrrigationService>,
    path: web::Path<String>,
    body: web::Json<CommandRequest>,
) -> impl Responder {
    let external_id = path.into_inner();
    match service
        .command_device(&external_id, &body.action, Utc::now())
        .await
    {
        Ok(command) => HttpResponse::Ok().json(command),
        Err(e) => error_response(&e),
    }
}

/// Publish a configuration object to a device
#[post("/{external_id}/config")]
pub async fn send_config(
    service: web::Data<IrrigationService>,
    path: web::Path<String>,
    body: web::Json<Value>,
) -> impl Responder {
    let external_id = path.into_inner();
    match service.configure_device(&external_id, &body).await {
        Ok(()) => HttpResponse::Accepted().json(serde_json::json!({ "published": true })),
        Err(e) => error_response(&e),
    }
}

/// Offer a firmware build to a device
#[post("/{external_id}/firmware")]
pub async fn send_firmware(
    service: web::Data<IrrigationService>,
    path: web::Path<String>,
    body: web::Json<FirmwareRelease>,
) -> impl Responder {
    let external_id = path.into_inner();
    match service.update_firmware(&external_id, &body).await {
        Ok(()) => HttpResponse::Accepted().json(serde_json::json!({
            "published": true,
            "version": body.version
        })),
        Err(e) => error_response(&e),
    }
}
