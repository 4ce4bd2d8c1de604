use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use updater::{CheckOutcome, DownloadOutcome, Orchestrator, Problem, SettingManager, Snapshot};

use crate::ApplicationState;

/// Either the handler's JSON body or one of the facade's problems.
#[derive(Debug)]
struct ApiResponse<T>(Result<T, Problem>);

fn status_of(problem: Problem) -> StatusCode {
    match problem {
        Problem::UnknownApp | Problem::UnknownProvider | Problem::NoSuchDownload => {
            StatusCode::NOT_FOUND
        }
        Problem::NoVersionInfo => StatusCode::CONFLICT,
        Problem::NoInternet | Problem::CouldNotDownload => StatusCode::BAD_GATEWAY,
        Problem::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        Problem::StorageUnavailable => StatusCode::INSUFFICIENT_STORAGE,
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self.0 {
            Ok(body) => Json(body).into_response(),
            Err(problem) => (status_of(problem), Json(json!({ "error": problem }))).into_response(),
        }
    }
}

/// Commands without a body answer 204.
#[derive(Debug)]
struct NoContent(Result<(), Problem>);

impl IntoResponse for NoContent {
    fn into_response(self) -> Response {
        match self.0 {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(problem) => (status_of(problem), Json(json!({ "error": problem }))).into_response(),
        }
    }
}

async fn get_snapshot(State(orchestrator): State<Orchestrator>) -> Json<Snapshot> {
    Json(orchestrator.snapshot())
}

/// A snapshot right away, then one after every change.
async fn events(
    State(orchestrator): State<Orchestrator>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut changes = orchestrator.subscribe();
    let stream = async_stream::stream! {
        loop {
            changes.borrow_and_update();
            match Event::default().event("snapshot").json_data(orchestrator.snapshot()) {
                Ok(event) => yield Ok(event),
                Err(e) => log::error!("Could not serialize snapshot: {}", e),
            }
            if changes.changed().await.is_err() {
                break;
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn check(State(orchestrator): State<Orchestrator>) -> ApiResponse<CheckOutcome> {
    ApiResponse(orchestrator.check_for_updates().await)
}

async fn update_app(
    State(orchestrator): State<Orchestrator>,
    Path(app): Path<String>,
) -> ApiResponse<DownloadOutcome> {
    ApiResponse(orchestrator.download_and_queue_install(&app).await)
}

async fn cancel_download(
    State(orchestrator): State<Orchestrator>,
    Path(file_name): Path<String>,
) -> NoContent {
    NoContent(orchestrator.cancel(&file_name).await)
}

#[derive(Debug, Deserialize)]
struct DefaultProvider {
    provider: String,
}

async fn set_default_provider(
    State(orchestrator): State<Orchestrator>,
    State(setting_manager): State<SettingManager>,
    Path(app): Path<String>,
    Json(body): Json<DefaultProvider>,
) -> NoContent {
    if let Err(problem) = orchestrator.set_default_provider(&app, &body.provider) {
        return NoContent(Err(problem));
    }
    let persisted = setting_manager
        .update(|settings| {
            settings
                .default_providers
                .insert(app.clone(), body.provider.clone());
        })
        .await;
    NoContent(persisted.map(|_| ()).map_err(|e| {
        log::error!("Could not persist the default provider of {}: {}", app, e);
        Problem::StorageUnavailable
    }))
}

pub fn routes() -> Router<ApplicationState> {
    Router::new()
        .route("/snapshot", get(get_snapshot))
        .route("/events", get(events))
        .route("/check", post(check))
        .route("/apps/:app/update", post(update_app))
        .route("/apps/:app/default-provider", put(set_default_provider))
        .route("/downloads/:file_name", delete(cancel_download))
}
