use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::{
    api::models::{
        AcceptInvitationResponse, AddMemberRequest, BudgetNameRequest, BulkUpsertRequest, CreateTransactionRequest,
        ErrorResponse, LoginRequest, RegisterRequest,
    },
    core::{
        models::{
            budget::{Budget, BudgetMember, Role},
            event::{UpdateOp, UpdatePayload},
            meta::MetaBundle,
            sync::{BulkItem, BulkUpsertOutcome, IdMapping, SoftDeleteOutcome},
            transaction::{RecordId, Tombstone, Transaction, TransactionFields, TransactionKind},
            user::AuthUser,
        },
        services::{LoginOutcome, MemberOutcome},
    },
};

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        super::handlers::register,
        super::handlers::login,
        super::handlers::me,
        super::handlers::get_settings,
        super::handlers::put_settings,
        super::handlers::list_budgets,
        super::handlers::create_budget,
        super::handlers::get_budget,
        super::handlers::rename_budget,
        super::handlers::delete_budget,
        super::handlers::add_member,
        super::handlers::accept_invitation,
        super::handlers::decline_invitation,
        super::handlers::list_transactions,
        super::handlers::create_transaction,
        super::handlers::bulk_upsert,
        super::handlers::list_tombstones,
        super::handlers::soft_delete_transaction,
        super::handlers::get_meta,
        super::handlers::put_meta,
        super::handlers::events
    ),
    components(schemas(
        RegisterRequest,
        LoginRequest,
        LoginOutcome,
        BudgetNameRequest,
        AddMemberRequest,
        MemberOutcome,
        AcceptInvitationResponse,
        CreateTransactionRequest,
        BulkUpsertRequest,
        ErrorResponse,
        AuthUser,
        Budget,
        BudgetMember,
        Role,
        Transaction,
        TransactionFields,
        TransactionKind,
        RecordId,
        Tombstone,
        BulkItem,
        BulkUpsertOutcome,
        IdMapping,
        SoftDeleteOutcome,
        MetaBundle,
        UpdateOp,
        UpdatePayload
    )),
    modifiers(&BearerAuth),
    info(
        title = "Budget Sync API",
        description = "Shared budgets with offline-first transaction sync",
        version = "0.1.0"
    )
)]
pub struct ApiDoc;
