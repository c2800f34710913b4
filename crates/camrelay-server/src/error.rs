use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use camrelay_protocol::ErrorBody;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// Channel unknown, or its publisher has not delivered media yet
    #[error("No publisher track for {0}")]
    NoSuchPublisher(String),

    /// The channel already has its one viewer
    #[error("Publisher {0} is already connected to a viewer (1:1 limit)")]
    ViewerSlotTaken(String),

    /// The media engine failed the offer/answer exchange
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("No such channel: {0}")]
    NoSuchChannel(String),

    #[error("Invalid input: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NoSuchPublisher(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ViewerSlotTaken(_) => StatusCode::CONFLICT,
            AppError::Negotiation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NoSuchChannel(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error kind
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NoSuchPublisher(_) => "no_such_publisher",
            AppError::ViewerSlotTaken(_) => "viewer_slot_taken",
            AppError::Negotiation(_) => "negotiation_error",
            AppError::NoSuchChannel(_) => "no_such_channel",
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                self.to_string()
            }
            AppError::Negotiation(_) => {
                tracing::warn!("{}", self);
                self.to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorBody {
            error: message,
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
