//! The wire-facing error taxonomy.
//!
//! Everything a client can observe failing maps onto one of these kinds;
//! the external HTTP layer turns [`ApiError::status_code`] into the response
//! status. The serializer wraps anything untaxonomized as [`ApiError::Internal`]
//! before it crosses a job boundary.

use snafu::Snafu;

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(display("Unauthorized: {msg}"))]
    Unauthorized { msg: String },
    #[snafu(display("Forbidden: {msg}"))]
    Forbidden { msg: String },
    #[snafu(display("Not found: {msg}"))]
    NotFound { msg: String },
    #[snafu(display("Conflict: {msg}"))]
    Conflict { msg: String },
    #[snafu(display("Server is busy with maintenance"))]
    Busy,
    #[snafu(display("Bad request: {msg}"))]
    BadRequest { msg: String },
    #[snafu(display("Account has exceeded its bandwidth"))]
    BandwidthExceeded,
    #[snafu(display("Internal error: {msg}"))]
    Internal { msg: String },
    #[snafu(display("Server is shutting down"))]
    ShuttingDown,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ApiError::Unauthorized { msg: msg.into() }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ApiError::Forbidden { msg: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound { msg: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError::Conflict { msg: msg.into() }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest { msg: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError::Internal { msg: msg.into() }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Unauthorized { .. } => 401,
            ApiError::Forbidden { .. } => 403,
            ApiError::NotFound { .. } => 404,
            ApiError::Conflict { .. } => 409,
            ApiError::Busy => 503,
            ApiError::BadRequest { .. } => 400,
            ApiError::BandwidthExceeded => 429,
            ApiError::Internal { .. } => 500,
            ApiError::ShuttingDown => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(ApiError::unauthorized("x").status_code(), 401);
        assert_eq!(ApiError::forbidden("x").status_code(), 403);
        assert_eq!(ApiError::not_found("x").status_code(), 404);
        assert_eq!(ApiError::conflict("x").status_code(), 409);
        assert_eq!(ApiError::Busy.status_code(), 503);
        assert_eq!(ApiError::bad_request("x").status_code(), 400);
        assert_eq!(ApiError::BandwidthExceeded.status_code(), 429);
        assert_eq!(ApiError::internal("x").status_code(), 500);
        assert_eq!(ApiError::ShuttingDown.status_code(), 503);
    }
}
