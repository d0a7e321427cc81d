use std::sync::Arc;

use actix_cors::Cors;
use actix_web::dev::ServerHandle;
use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{middleware::Logger, web, App, HttpRequest, HttpResponse, HttpServer, Result};
use tracing::{info, warn};

use super::{CommandReply, CommandRouter, GatewayError, RejectionKind};
use crate::address::NodeAddress;

async fn command(
    body: web::Json<serde_json::Value>,
    router: web::Data<CommandRouter>,
) -> Result<HttpResponse> {
    let reply = router.dispatch_json(body.into_inner()).await;
    Ok(HttpResponse::Ok().json(reply))
}

// Bodies that are not JSON at all still get a marker reply, with a 400.
fn reject_payload(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    warn!("Unreadable command body: {}", err);
    let reply = CommandReply::reject(RejectionKind::Malformed, err.to_string());
    InternalError::from_response(err, HttpResponse::BadRequest().json(reply)).into()
}

async fn status(router: web::Data<CommandRouter>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(router.status()))
}

async fn health(router: web::Data<CommandRouter>) -> Result<HttpResponse> {
    let status = router.status();
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "address": status.address,
        "role": status.role,
    })))
}

/// Routes served on a node's gateway address
pub fn configure_gateway(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(reject_payload))
        .route("/command", web::post().to(command))
        .route("/status", web::get().to(status))
        .route("/health", web::get().to(health));
}

/// Bind the gateway and run it in the background.
pub fn serve(
    address: &NodeAddress,
    router: Arc<CommandRouter>,
    workers: usize,
) -> Result<ServerHandle, GatewayError> {
    let data = web::Data::from(router);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .configure(configure_gateway)
    })
    .workers(workers)
    .disable_signals()
    .bind(address.authority())
    .map_err(|source| GatewayError::Bind {
        address: address.clone(),
        source,
    })?
    .run();

    let handle = server.handle();
    actix_web::rt::spawn(server);
    info!(address = %address, "Client gateway listening");
    Ok(handle)
}
