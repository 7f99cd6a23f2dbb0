use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};

use crate::config::WebConfig;
use crate::web::handlers;
use crate::web::state::AppState;

/// Start the web server with the given configuration and application state
pub async fn start_web_server(config: WebConfig, state: AppState) -> Result<()> {
    if !config.enabled {
        tracing::info!("Web server is disabled in configuration");
        return Ok(());
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Starting web server on {}", bind_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .route("/api/status", web::get().to(handlers::get_status))
            .route(
                "/api/projects/{project_id}/sessions/{session_id}",
                web::get().to(handlers::get_session),
            )
            .route(
                "/api/projects/{project_id}/sessions/{session_id}/commit",
                web::post().to(handlers::commit_session),
            )
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind web server to {}", bind_addr))?
    .run()
    .await
    .context("Web server error")?;

    Ok(())
}
