use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
pub struct FieldError {
    pub field: String,
    pub title: String,
    pub description: String,
}

#[derive(Error, Debug, Serialize)]
pub enum BudgetError {
    #[error("Email is required")]
    MissingEmail,
    #[error("Email {0} already registered")]
    EmailAlreadyRegistered(String),
    #[error("Invalid email format: {0}")]
    InvalidEmail(String),
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Missing bearer token")]
    MissingToken,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Token expired")]
    ExpiredToken,
    #[error("User {0} not found")]
    UserNotFound(i64),
    #[error("Budget {0} not found")]
    BudgetNotFound(i64),
    #[error("User {0} is not a member of budget {1}")]
    NotBudgetMember(i64, i64),
    #[error("User {0} is not the owner of budget {1}")]
    NotBudgetOwner(i64, i64),
    #[error("Transaction {0} not found")]
    TransactionNotFound(i64),
    #[error("Invitation not found")]
    InvitationNotFound,
    #[error("Invitation expired")]
    InvitationExpired,
    #[error("Invitation already {0}")]
    InvitationAlreadyResolved(String),
    #[error("Invalid input for field `{0}`: {1:?}")]
    InvalidInput(String, FieldError),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl BudgetError {
    pub fn invalid_input(field: &str, description: impl Into<String>) -> Self {
        BudgetError::InvalidInput(
            field.to_string(),
            FieldError {
                field: field.to_string(),
                title: format!("Invalid {}", field),
                description: description.into(),
            },
        )
    }
}
