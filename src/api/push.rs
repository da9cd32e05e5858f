use crate::api::AppState;
use crate::api::schemas::push::{MessageResponse, PushRequest};
use crate::domain::job::PushJob;
use crate::error::{AppError, Result};
use axum::{Json, extract::State};

/// Validates every notification, then enqueues them all.
#[tracing::instrument(skip_all, fields(count = req.notifications.len()))]
pub async fn submit(State(state): State<AppState>, Json(req): Json<PushRequest>) -> Result<Json<MessageResponse>> {
    if req.notifications.is_empty() {
        return Err(AppError::BadRequest("empty notification".to_string()));
    }

    let mut jobs = Vec::with_capacity(req.notifications.len());
    for entry in req.notifications {
        let job = PushJob::try_from(entry).map_err(AppError::BadRequest)?;
        if !state.engine.is_enabled(job.platform()) {
            return Err(AppError::BadRequest(format!("{} is not enabled", job.platform())));
        }
        job.validate(state.limits)?;
        jobs.push(job);
    }

    state.engine.submit_all(jobs)?;
    Ok(Json(MessageResponse::ok()))
}
