use crate::api::AppState;
use crate::api::schemas::push::MessageResponse;
use axum::{
    Json,
    extract::{Query, State, rejection::QueryRejection},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Rejections of the live pusher update. The engine is never touched when one is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionInputError {
    #[error("method must be PUT")]
    WrongMethod,
    #[error("malformed value")]
    Malformed,
}

impl IntoResponse for AdmissionInputError {
    fn into_response(self) -> Response {
        tracing::debug!(error = %self, "Rejected pusher update");
        (StatusCode::BAD_REQUEST, Json(MessageResponse { message: self.to_string() })).into_response()
    }
}

/// Parses a non-negative integer the way operators type it: decimal, or with a `0x`, `0o`, `0b`
/// or leading `0` (octal) prefix. A sign is allowed, so `-0` is zero.
///
/// # Errors
/// Returns `AdmissionInputError::Malformed` for empty, negative, non-numeric or out of range input.
pub fn parse_pusher_max(raw: &str) -> Result<u64, AdmissionInputError> {
    let digits = raw.trim();
    let (negative, digits) = match digits.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, digits.strip_prefix('+').unwrap_or(digits)),
    };
    let (radix, body) = match digits.as_bytes() {
        [b'0', b'x' | b'X', ..] => (16, &digits[2..]),
        [b'0', b'o' | b'O', ..] => (8, &digits[2..]),
        [b'0', b'b' | b'B', ..] => (2, &digits[2..]),
        [b'0', _, ..] => (8, &digits[1..]),
        _ => (10, digits),
    };
    if body.is_empty() || !body.chars().all(|c| c.is_digit(radix)) {
        return Err(AdmissionInputError::Malformed);
    }
    let value = u64::from_str_radix(body, radix).map_err(|_| AdmissionInputError::Malformed)?;
    if i64::try_from(value).is_err() || (negative && value != 0) {
        return Err(AdmissionInputError::Malformed);
    }
    Ok(value)
}

/// Replaces the live pusher cap. Applies to the next send and never waits on in-flight ones.
///
/// When `max` is repeated the first occurrence wins.
pub async fn update_pushers(
    State(state): State<AppState>,
    method: Method,
    params: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<MessageResponse>, AdmissionInputError> {
    if method != Method::PUT {
        return Err(AdmissionInputError::WrongMethod);
    }
    let Ok(Query(params)) = params else {
        return Err(AdmissionInputError::Malformed);
    };
    let raw = params.iter().find(|(key, _)| key == "max").map_or("", |(_, value)| value.as_str());
    let max = parse_pusher_max(raw)?;

    state.engine.admission().set_limit(max);
    Ok(Json(MessageResponse::ok()))
}
