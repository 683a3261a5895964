use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, Router};
use thiserror::Error;
use tokio::{net::TcpListener, signal, sync::broadcast, task};
use tower_http::cors::{Any, CorsLayer};

use crate::constants::LISTEN_ADDR;
use crate::{bridge, proxy, AppContext};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Assembles the full router: the Anthropic surface (user-agent gated)
/// plus the bridge endpoints (local shim traffic, ungated).
pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    proxy::routes(ctx.clone())
        .merge(bridge::routes::routes(ctx.clone()))
        .layer(DefaultBodyLimit::max(ctx.config.body_limit))
        .layer(cors)
}

/// Binds the listener and serves until ctrl-c, then stops live sessions
/// best-effort (each stop is hard-capped so shutdown cannot hang).
pub async fn run(ctx: Arc<AppContext>) -> Result<(), ServerError> {
    let addr = format!("{}:{}", LISTEN_ADDR, ctx.port);
    let listener = TcpListener::bind(&addr).await.map_err(|source| {
        log::error!("Failed to bind {}: {}", addr, source);
        ServerError::Bind {
            addr: addr.clone(),
            source,
        }
    })?;

    log::info!("Serving Xcode proxy on http://{}", addr);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let signal_handle = task::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    let app = build_router(ctx.clone());
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    });

    let result = server.await.map_err(ServerError::Serve);

    stop_sessions(&ctx).await;
    signal_handle.abort();

    match result {
        Ok(()) => {
            log::info!("Server shut down gracefully");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn stop_sessions(ctx: &AppContext) {
    let conversations = ctx.manager.all();
    if conversations.is_empty() {
        return;
    }
    log::info!("Stopping {} live session(s)", conversations.len());
    for conversation in conversations {
        let control = conversation.session.lock().await.take();
        if let Some(control) = control {
            control.stop().await;
        }
        conversation.state.cleanup();
    }
}
