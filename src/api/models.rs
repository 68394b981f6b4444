use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::errors::BudgetError;
use crate::core::models::{budget::Role, sync::BulkItem, transaction::TransactionFields};

// Request structs for JSON payloads
#[derive(Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct BudgetNameRequest {
    pub name: String,
}

#[derive(Deserialize, ToSchema)]
pub struct AddMemberRequest {
    pub email: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    pub budget_id: i64,
    #[serde(flatten)]
    pub fields: TransactionFields,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpsertRequest {
    pub budget_id: i64,
    #[serde(default)]
    pub items: Vec<BulkItem>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceptInvitationResponse {
    pub budget_id: i64,
}

// Query strings
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetQuery {
    pub budget_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TombstoneQuery {
    pub budget_id: i64,
    pub since: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub budget_id: i64,
    pub token: Option<String>,
}

// Error response struct
#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

// Newtype wrapper for BudgetError to implement IntoResponse
pub struct ApiError(pub BudgetError);

impl From<BudgetError> for ApiError {
    fn from(err: BudgetError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(BudgetError::invalid_input("body", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(BudgetError::invalid_input("query", rejection.body_text()))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BudgetError::MissingEmail
            | BudgetError::InvalidEmail(_)
            | BudgetError::InvalidInput(..)
            | BudgetError::InvitationExpired => StatusCode::BAD_REQUEST,
            BudgetError::InvalidCredentials
            | BudgetError::MissingToken
            | BudgetError::InvalidToken(_)
            | BudgetError::ExpiredToken
            | BudgetError::UserNotFound(_) => StatusCode::UNAUTHORIZED,
            BudgetError::NotBudgetMember(..) | BudgetError::NotBudgetOwner(..) => StatusCode::FORBIDDEN,
            BudgetError::BudgetNotFound(_)
            | BudgetError::TransactionNotFound(_)
            | BudgetError::InvitationNotFound => StatusCode::NOT_FOUND,
            BudgetError::EmailAlreadyRegistered(_) | BudgetError::InvitationAlreadyResolved(_) => {
                StatusCode::CONFLICT
            }
            BudgetError::StorageError(_) | BudgetError::InternalServerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let error_message = match self.0 {
            BudgetError::InvalidInput(_, detail) => detail.description,
            BudgetError::StorageError(msg) => {
                tracing::error!("Storage error: {}", msg);
                "Storage error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}
