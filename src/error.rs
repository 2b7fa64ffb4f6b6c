use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::config::LineId;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("GPIO is not yet open")]
    NotOpen,
    #[error("not yet polling GPIO")]
    NotPolling,
    #[error("Line {0} is already registered, remove the registration first")]
    AlreadyRegistered(LineId),
    #[error("Line {0} is not registered")]
    NotRegistered(LineId),
    #[error("Poller is not accepting commands: {0}")]
    MailboxClosed(String),
    #[error("Line not found: {0}")]
    NotFoundLine(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotOpen
            | AppError::NotPolling
            | AppError::AlreadyRegistered(_) => StatusCode::CONFLICT,
            AppError::NotRegistered(_) | AppError::NotFoundLine(_) => StatusCode::NOT_FOUND,
            AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::MailboxClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::Gpio(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
