mod routes;
pub mod shell;

use std::future::Future;
use std::net::TcpListener;

use axum::extract::FromRef;
use axum::Router;
use routes::routes;
use updater::{Orchestrator, SettingManager};

/// Binds the bridge routes to an already listening socket and serves until
/// `shutdown` resolves.
pub async fn launch_app(
    listener: TcpListener,
    state: ApplicationState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::Server::from_tcp(listener)?
        .serve(app(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn app(state: ApplicationState) -> Router {
    Router::new().nest("/api/v1", routes().with_state(state))
}

#[derive(Clone, FromRef)]
pub struct ApplicationState {
    pub orchestrator: Orchestrator,
    pub setting_manager: SettingManager,
}
