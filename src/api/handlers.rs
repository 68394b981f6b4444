use crate::{
    api::models::*,
    core::{
        errors::BudgetError,
        models::{
            budget::Budget,
            meta::MetaBundle,
            sync::{BulkUpsertOutcome, SoftDeleteOutcome},
            transaction::{Tombstone, Transaction},
            user::AuthUser,
        },
        services::{BudgetService, LoginOutcome, MemberOutcome},
    },
    infrastructure::storage::json_file::JsonFileStorage,
};
use axum::{
    Extension, Json, Router,
    extract::{
        Path, Query, Request, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        IntoResponse,
        sse::{Event, Sse},
    },
    routing::{delete, get, post},
};
use futures::{Stream, StreamExt};
use http::header;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

pub type AppService = BudgetService<JsonFileStorage>;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AppService>,
    pub ping_every: Duration,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

// Middleware to validate JWT
async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<impl IntoResponse, ApiError> {
    let token = bearer_token(req.headers()).ok_or(BudgetError::MissingToken)?;
    let user = state.service.authenticate(token).await?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

// Define API routes
pub fn api_routes(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/me", get(me))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/budgets", get(list_budgets).post(create_budget))
        .route(
            "/budgets/{budget_id}",
            get(get_budget).put(rename_budget).delete(delete_budget),
        )
        .route("/budgets/{budget_id}/members", post(add_member))
        .route("/budgets/{budget_id}/meta", get(get_meta).put(put_meta))
        .route("/invitations/{token}/accept", post(accept_invitation))
        .route("/invitations/{token}/decline", post(decline_invitation))
        .route("/transactions", get(list_transactions).post(create_transaction))
        .route("/transactions/bulk", post(bulk_upsert))
        .route("/transactions/tombstones", get(list_tombstones))
        .route("/transactions/{id}", delete(soft_delete_transaction))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/events", get(events)) // Token may arrive in the query string
        .merge(protected_routes)
        .with_state(state)
}

#[utoipa::path(
    post,
    path = "/api/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = AuthUser),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthUser>), ApiError> {
    let Json(req) = payload?;
    let user = state.service.register(&req.email, &req.password, &req.name).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    post,
    path = "/api/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginOutcome),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginOutcome>, ApiError> {
    let Json(req) = payload?;
    let outcome = state.service.login(&req.email, &req.password).await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    get,
    path = "/api/me",
    responses(
        (status = 200, description = "Current user", body = AuthUser),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn me(Extension(user): Extension<AuthUser>) -> Json<AuthUser> {
    Json(user)
}

#[utoipa::path(
    get,
    path = "/api/settings",
    responses(
        (status = 200, description = "Settings object of the current user, empty when never written", body = Object),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn get_settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    let data = state.service.get_settings(&user).await?;
    Ok(Json(data))
}

#[utoipa::path(
    put,
    path = "/api/settings",
    request_body = Object,
    responses(
        (status = 200, description = "Stored settings object", body = Object),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn put_settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(data) = payload?;
    let stored = state.service.put_settings(&user, data).await?;
    Ok(Json(stored))
}

#[utoipa::path(
    get,
    path = "/api/budgets",
    responses(
        (status = 200, description = "Budgets the caller owns or belongs to", body = [Budget]),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn list_budgets(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<Budget>>, ApiError> {
    let budgets = state.service.list_budgets(&user).await?;
    Ok(Json(budgets))
}

#[utoipa::path(
    post,
    path = "/api/budgets",
    request_body = BudgetNameRequest,
    responses(
        (status = 201, description = "Budget created", body = Budget),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn create_budget(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<BudgetNameRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Budget>), ApiError> {
    let Json(req) = payload?;
    let budget = state.service.create_budget(&user, &req.name).await?;
    Ok((StatusCode::CREATED, Json(budget)))
}

#[utoipa::path(
    get,
    path = "/api/budgets/{budget_id}",
    params(
        ("budget_id" = i64, Path, description = "ID of the budget")
    ),
    responses(
        (status = 200, description = "Budget", body = Budget),
        (status = 403, description = "Not a member", body = ErrorResponse),
        (status = 404, description = "Budget not found", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn get_budget(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(budget_id): Path<i64>,
) -> Result<Json<Budget>, ApiError> {
    let budget = state.service.get_budget(&user, budget_id).await?;
    Ok(Json(budget))
}

#[utoipa::path(
    put,
    path = "/api/budgets/{budget_id}",
    request_body = BudgetNameRequest,
    params(
        ("budget_id" = i64, Path, description = "ID of the budget")
    ),
    responses(
        (status = 200, description = "Budget renamed", body = Budget),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 403, description = "Not the owner", body = ErrorResponse),
        (status = 404, description = "Budget not found", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn rename_budget(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(budget_id): Path<i64>,
    payload: Result<Json<BudgetNameRequest>, JsonRejection>,
) -> Result<Json<Budget>, ApiError> {
    let Json(req) = payload?;
    let budget = state.service.rename_budget(&user, budget_id, &req.name).await?;
    Ok(Json(budget))
}

#[utoipa::path(
    delete,
    path = "/api/budgets/{budget_id}",
    params(
        ("budget_id" = i64, Path, description = "ID of the budget to delete")
    ),
    responses(
        (status = 204, description = "Budget and its data deleted"),
        (status = 403, description = "Not the owner", body = ErrorResponse),
        (status = 404, description = "Budget not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn delete_budget(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(budget_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_budget(&user, budget_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/budgets/{budget_id}/members",
    request_body = AddMemberRequest,
    params(
        ("budget_id" = i64, Path, description = "ID of the budget")
    ),
    responses(
        (status = 200, description = "Member added or invitation created", body = MemberOutcome),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 403, description = "Not the owner", body = ErrorResponse),
        (status = 404, description = "Budget not found", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn add_member(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(budget_id): Path<i64>,
    payload: Result<Json<AddMemberRequest>, JsonRejection>,
) -> Result<Json<MemberOutcome>, ApiError> {
    let Json(req) = payload?;
    let outcome = state.service.add_member(&user, budget_id, &req.email, req.role).await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    post,
    path = "/api/invitations/{token}/accept",
    params(
        ("token" = String, Path, description = "Invitation token")
    ),
    responses(
        (status = 200, description = "Joined the budget", body = AcceptInvitationResponse),
        (status = 400, description = "Invitation expired", body = ErrorResponse),
        (status = 404, description = "Invitation not found", body = ErrorResponse),
        (status = 409, description = "Invitation already resolved", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn accept_invitation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(token): Path<String>,
) -> Result<Json<AcceptInvitationResponse>, ApiError> {
    let budget_id = state.service.accept_invitation(&user, &token).await?;
    Ok(Json(AcceptInvitationResponse { budget_id }))
}

#[utoipa::path(
    post,
    path = "/api/invitations/{token}/decline",
    params(
        ("token" = String, Path, description = "Invitation token")
    ),
    responses(
        (status = 204, description = "Invitation declined"),
        (status = 404, description = "Invitation not found", body = ErrorResponse),
        (status = 409, description = "Invitation already resolved", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn decline_invitation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(token): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.decline_invitation(&user, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/transactions",
    params(
        ("budgetId" = i64, Query, description = "ID of the budget")
    ),
    responses(
        (status = 200, description = "Transactions that are not deleted", body = [Transaction]),
        (status = 403, description = "Not a member", body = ErrorResponse),
        (status = 404, description = "Budget not found", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    query: Result<Query<BudgetQuery>, QueryRejection>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let Query(query) = query?;
    let transactions = state.service.list_active(&user, query.budget_id).await?;
    Ok(Json(transactions))
}

#[utoipa::path(
    post,
    path = "/api/transactions",
    request_body = CreateTransactionRequest,
    responses(
        (status = 201, description = "Transaction created", body = Transaction),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 403, description = "Not a member", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn create_transaction(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<CreateTransactionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    let Json(req) = payload?;
    let created = state
        .service
        .create_transaction(&user, req.budget_id, req.fields)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    post,
    path = "/api/transactions/bulk",
    request_body = BulkUpsertRequest,
    responses(
        (status = 200, description = "Batch reconciled", body = BulkUpsertOutcome),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 403, description = "Not a member", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn bulk_upsert(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<BulkUpsertRequest>, JsonRejection>,
) -> Result<Json<BulkUpsertOutcome>, ApiError> {
    let Json(req) = payload?;
    let outcome = state.service.bulk_upsert(&user, req.budget_id, req.items).await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    get,
    path = "/api/transactions/tombstones",
    params(
        ("budgetId" = i64, Query, description = "ID of the budget"),
        ("since" = Option<i64>, Query, description = "Only deletions after this feed position (`seq` of the last tombstone seen)")
    ),
    responses(
        (status = 200, description = "Recent deletions", body = [Tombstone]),
        (status = 403, description = "Not a member", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn list_tombstones(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    query: Result<Query<TombstoneQuery>, QueryRejection>,
) -> Result<Json<Vec<Tombstone>>, ApiError> {
    let Query(query) = query?;
    let tombstones = state
        .service
        .list_tombstones(&user, query.budget_id, query.since)
        .await?;
    Ok(Json(tombstones))
}

#[utoipa::path(
    delete,
    path = "/api/transactions/{id}",
    params(
        ("id" = i64, Path, description = "ID of the transaction")
    ),
    responses(
        (status = 200, description = "Transaction tombstoned", body = SoftDeleteOutcome),
        (status = 403, description = "Not a member", body = ErrorResponse),
        (status = 404, description = "Transaction not found", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn soft_delete_transaction(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<SoftDeleteOutcome>, ApiError> {
    let outcome = state.service.soft_delete(&user, id).await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    get,
    path = "/api/budgets/{budget_id}/meta",
    params(
        ("budget_id" = i64, Path, description = "ID of the budget")
    ),
    responses(
        (status = 200, description = "Metadata bundle", body = MetaBundle),
        (status = 403, description = "Not a member", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn get_meta(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(budget_id): Path<i64>,
) -> Result<Json<MetaBundle>, ApiError> {
    let bundle = state.service.get_meta(&user, budget_id).await?;
    Ok(Json(bundle))
}

#[utoipa::path(
    put,
    path = "/api/budgets/{budget_id}/meta",
    request_body = MetaBundle,
    params(
        ("budget_id" = i64, Path, description = "ID of the budget")
    ),
    responses(
        (status = 200, description = "Stored metadata bundle", body = MetaBundle),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 403, description = "Not a member", body = ErrorResponse)
    ),
    security(("Bearer" = []))
)]
pub async fn put_meta(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(budget_id): Path<i64>,
    payload: Result<Json<MetaBundle>, JsonRejection>,
) -> Result<Json<MetaBundle>, ApiError> {
    let Json(bundle) = payload?;
    let stored = state.service.put_meta(&user, budget_id, bundle).await?;
    Ok(Json(stored))
}

#[utoipa::path(
    get,
    path = "/api/events",
    params(
        ("budgetId" = i64, Query, description = "ID of the budget"),
        ("token" = Option<String>, Query, description = "Bearer token, for clients that cannot set headers")
    ),
    responses(
        (status = 200, description = "Server-sent event stream of hello, ping and update events"),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Not a member", body = ErrorResponse)
    )
)]
pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Query(query) = query?;
    let token = bearer_token(&headers)
        .map(str::to_string)
        .or(query.token)
        .ok_or(BudgetError::MissingToken)?;
    let subscription = state.service.subscribe(&token, query.budget_id).await?;
    let stream = subscription
        .into_stream(state.ping_every)
        .map(|event| Ok(Event::default().event(event.name()).data(event.data())));
    Ok(Sse::new(stream))
}
