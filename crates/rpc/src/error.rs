use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ethersim_bus::BusError;
use ethersim_core::TransmissionId;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CommunicateResponse;

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Transmission failed after exhausting its attempts")]
    Failed(Box<CommunicateResponse>),

    #[error("Transmission was cancelled before completing")]
    Cancelled(Box<CommunicateResponse>),

    #[error("Transmission {0} not found")]
    NotFound(TransmissionId),

    #[error("Timed out waiting for transmission {0}")]
    Timeout(TransmissionId),

    #[error("Simulation is not running")]
    Unavailable,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Bus(e) => match e {
                BusError::EmptyMessage | BusError::InvalidReceiver { .. } | BusError::InvalidSender(_) => {
                    StatusCode::BAD_REQUEST
                }
                BusError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                BusError::UnknownTransmission(_) => StatusCode::NOT_FOUND,
                BusError::CancelInFlight(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Failed(_) | ApiError::Cancelled(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {}", self);
        } else {
            warn!("request rejected: {}", self);
        }
        match self {
            // the outcome still carries the full communicate body
            ApiError::Failed(body) | ApiError::Cancelled(body) => (status, Json(*body)).into_response(),
            other => (status, Json(ErrorBody { message: other.to_string() })).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::from(BusError::EmptyMessage).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(BusError::InvalidReceiver { sender: 1, receiver: 1 }).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(BusError::PayloadTooLarge { len: 2000, mtu: 1500 }).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(ApiError::from(BusError::CancelInFlight(3)).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(BusError::Invariant("two occupants".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiError::Timeout(1).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::Unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
