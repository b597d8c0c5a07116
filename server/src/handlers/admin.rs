use crate::registry::{AdminCommand, ServerCommand, ServerTx};
use actix_web::error;
use actix_web::{web, HttpResponse};
use actix_web::Result;
use system::{DocumentId, SessionSummary};

pub fn configure_admin_handlers(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .service(
                web::resource("/sessions")
                    .name("admin_sessions")
                    .route(web::get().to(list_sessions)),
            )
            .service(
                web::resource("/sessions/{document_id}")
                    .name("admin_session")
                    .route(web::get().to(show_session)),
            ),
    );
}

pub async fn list_sessions(srv_tx: web::Data<ServerTx>) -> Result<HttpResponse> {
    let (tx, rx) = tokio::sync::oneshot::channel::<Vec<SessionSummary>>();

    srv_tx
        .send(ServerCommand::Admin(AdminCommand::ListSessions { tx }))
        .await
        .map_err(|_| error::ErrorInternalServerError("Internal Server Error"))?;

    let sessions = rx
        .await
        .map_err(|_| error::ErrorInternalServerError("Receiver await error"))?;

    Ok(HttpResponse::Ok().json(sessions))
}

pub async fn show_session(
    path: web::Path<DocumentId>,
    srv_tx: web::Data<ServerTx>,
) -> Result<HttpResponse> {
    let document_id = path.into_inner();
    let (tx, rx) = tokio::sync::oneshot::channel::<Option<SessionSummary>>();

    srv_tx
        .send(ServerCommand::Admin(AdminCommand::DescribeSession {
            document_id: document_id.clone(),
            tx,
        }))
        .await
        .map_err(|_| error::ErrorInternalServerError("Internal Server Error"))?;

    let summary = rx
        .await
        .map_err(|_| error::ErrorInternalServerError("Receiver await error"))?
        .ok_or_else(|| error::ErrorNotFound(format!("no open session for {}", document_id)))?;

    Ok(HttpResponse::Ok().json(summary))
}
