use std::fmt;

/// Outcome classification for every membership/auth operation. The command
/// layer renders these as `ERR <status>: <message>` lines; the WebSocket
/// layer turns them into `error` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// A referenced entity (user, chat, request) does not exist.
    NotFound(String),
    /// Authenticated but not allowed to touch this object.
    Forbidden(String),
    /// Missing or invalid session token.
    Unauthenticated,
    /// The state already satisfies the opposite of the request.
    Conflict(String),
    /// Malformed or out-of-bounds input.
    InvalidInput(String),
    /// Unexpected persistence failure.
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    // Missing entities surface as 422 unprocessable.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 422,
            ApiError::Forbidden(_) => 403,
            ApiError::Unauthenticated => 401,
            ApiError::Conflict(_) => 409,
            ApiError::InvalidInput(_) => 400,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::NotFound(m)
            | ApiError::Forbidden(m)
            | ApiError::Conflict(m)
            | ApiError::InvalidInput(m)
            | ApiError::Internal(m) => m,
            ApiError::Unauthenticated => "Invalid or expired session",
        }
    }

    /// Wire rendering for the command listener.
    pub fn render(&self) -> String {
        format!("ERR {}: {}", self.status(), self.message())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(format!("DB error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_per_error_kind() {
        assert_eq!(ApiError::NotFound("x".into()).status(), 422);
        assert_eq!(ApiError::Forbidden("x".into()).status(), 403);
        assert_eq!(ApiError::Unauthenticated.status(), 401);
        assert_eq!(ApiError::Conflict("x".into()).status(), 409);
        assert_eq!(ApiError::InvalidInput("x".into()).status(), 400);
        assert_eq!(ApiError::Internal("x".into()).status(), 500);
    }

    #[test]
    fn render_is_an_err_line() {
        let e = ApiError::Conflict("A chat already exists".into());
        assert_eq!(e.render(), "ERR 409: A chat already exists");
    }
}
