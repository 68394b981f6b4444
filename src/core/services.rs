use crate::auth::jwt::JwtService;
use crate::config::Config;
use crate::core::errors::BudgetError;
use crate::core::fingerprint;
use crate::core::models::{
    budget::{Budget, BudgetMember, Role},
    event::{UpdateOp, UpdatePayload},
    invitation::{Invitation, InvitationStatus},
    meta::MetaBundle,
    settings::{self, UserSettings},
    sync::{BulkItem, BulkUpsertOutcome, IdMapping, SoftDeleteOutcome},
    transaction::{Tombstone, Transaction, TransactionFields, next_tombstone_seq},
    user::{AuthUser, User},
};
use crate::core::notifier::{ChangeNotifier, Subscription};
use crate::infrastructure::storage::{
    BudgetSet, Collection, InvitationSet, MetaStore, SettingsSet, Storage, TransactionSet, UserSet,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Tunables that do not belong to any single request.
#[derive(Clone, Debug)]
pub struct ServiceSettings {
    pub session_ttl: Duration,
    pub invitation_ttl: Duration,
    pub tombstone_horizon: Duration,
    pub bcrypt_cost: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            session_ttl: Duration::days(7),
            invitation_ttl: Duration::days(7),
            tombstone_horizon: Duration::days(30),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        ServiceSettings {
            session_ttl: Duration::hours(config.session_ttl_hours),
            tombstone_horizon: Duration::days(config.tombstone_horizon_days),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, ToSchema, Clone)]
pub struct LoginOutcome {
    pub token: String,
    pub user: AuthUser,
}

#[derive(Serialize, Deserialize, Debug, ToSchema, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MemberOutcome {
    Added {
        #[serde(rename = "userId")]
        user_id: i64,
    },
    Invited {
        token: String,
    },
}

pub struct BudgetService<S: Storage> {
    storage: S,
    notifier: ChangeNotifier,
    jwt_service: JwtService,
    settings: ServiceSettings,
}

impl<S: Storage> BudgetService<S> {
    pub fn new(storage: S, notifier: ChangeNotifier, jwt_secret: String, settings: ServiceSettings) -> Self {
        BudgetService {
            storage,
            notifier,
            jwt_service: JwtService::new(jwt_secret),
            settings,
        }
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    fn validate_string_input(&self, field: &str, value: &str, max_length: usize) -> Result<(), BudgetError> {
        if value.trim().is_empty() {
            return Err(BudgetError::invalid_input(field, format!("{} cannot be empty", field)));
        }
        if value.chars().count() > max_length {
            return Err(BudgetError::invalid_input(
                field,
                format!("{} cannot exceed {} characters", field, max_length),
            ));
        }
        Ok(())
    }

    async fn require_member(&self, user: &AuthUser, budget_id: i64) -> Result<Budget, BudgetError> {
        let budgets: BudgetSet = self.storage.read(Collection::Budgets).await?;
        let budget = budgets
            .into_iter()
            .find(|b| b.id == budget_id)
            .ok_or(BudgetError::BudgetNotFound(budget_id))?;
        if !budget.is_member(user.id) {
            warn!("User {} denied access to budget {}", user.id, budget_id);
            return Err(BudgetError::NotBudgetMember(user.id, budget_id));
        }
        Ok(budget)
    }

    async fn require_owner(&self, user: &AuthUser, budget_id: i64) -> Result<Budget, BudgetError> {
        let budget = self.require_member(user, budget_id).await?;
        if !budget.is_owner(user.id) {
            return Err(BudgetError::NotBudgetOwner(user.id, budget_id));
        }
        Ok(budget)
    }

    // USERS AND SESSIONS

    pub async fn register(&self, email: &str, password: &str, name: &str) -> Result<AuthUser, BudgetError> {
        let email = email.trim().to_string();
        if email.is_empty() {
            return Err(BudgetError::MissingEmail);
        }
        if !email.contains('@') || !email.contains('.') || email.len() < 5 {
            return Err(BudgetError::InvalidEmail(email));
        }
        if password.is_empty() {
            return Err(BudgetError::invalid_input("password", "Password cannot be empty"));
        }
        let password_hash = bcrypt::hash(password, self.settings.bcrypt_cost)
            .map_err(|e| BudgetError::InternalServerError(format!("Password hashing error: {}", e)))?;
        let name = name.trim().to_string();

        let user = self
            .storage
            .update(Collection::Users, |users: &mut UserSet| {
                if users.iter().any(|u| u.email.eq_ignore_ascii_case(&email)) {
                    return Err(BudgetError::EmailAlreadyRegistered(email.clone()));
                }
                let user = User {
                    id: users.iter().map(|u| u.id).max().unwrap_or(0) + 1,
                    email: email.clone(),
                    name,
                    password_hash,
                    created_at: now_millis(),
                };
                users.push(user.clone());
                Ok(user)
            })
            .await?;
        info!("Registered user {}", user.id);
        Ok(AuthUser::from(&user))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, BudgetError> {
        let users: UserSet = self.storage.read(Collection::Users).await?;
        let user = users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email.trim()))
            .ok_or(BudgetError::InvalidCredentials)?;

        let valid = bcrypt::verify(password, &user.password_hash)
            .map_err(|e| BudgetError::InternalServerError(format!("Password verification error: {}", e)))?;
        if !valid {
            warn!("Failed login for user {}", user.id);
            return Err(BudgetError::InvalidCredentials);
        }
        let token = self.jwt_service.generate_token(user.id, self.settings.session_ttl)?;
        info!("User {} logged in", user.id);
        Ok(LoginOutcome {
            token,
            user: AuthUser::from(user),
        })
    }

    /// Resolves a bearer token to a live user.
    pub async fn authenticate(&self, token: &str) -> Result<AuthUser, BudgetError> {
        if token.trim().is_empty() {
            return Err(BudgetError::MissingToken);
        }
        let claims = self.jwt_service.validate_token(token)?;
        let users: UserSet = self.storage.read(Collection::Users).await?;
        users
            .iter()
            .find(|u| u.id == claims.sub)
            .map(AuthUser::from)
            .ok_or(BudgetError::UserNotFound(claims.sub))
    }

    // BUDGETS

    pub async fn list_budgets(&self, user: &AuthUser) -> Result<Vec<Budget>, BudgetError> {
        let budgets: BudgetSet = self.storage.read(Collection::Budgets).await?;
        Ok(budgets.into_iter().filter(|b| b.is_member(user.id)).collect())
    }

    pub async fn get_budget(&self, user: &AuthUser, budget_id: i64) -> Result<Budget, BudgetError> {
        self.require_member(user, budget_id).await
    }

    pub async fn create_budget(&self, user: &AuthUser, name: &str) -> Result<Budget, BudgetError> {
        self.validate_string_input("name", name, 100)?;
        let name = name.trim().to_string();
        let owner_id = user.id;
        let budget = self
            .storage
            .update(Collection::Budgets, |budgets: &mut BudgetSet| {
                let budget = Budget {
                    id: budgets.iter().map(|b| b.id).max().unwrap_or(0) + 1,
                    name,
                    owner_id,
                    members: Vec::new(),
                    created_at: now_millis(),
                };
                budgets.push(budget.clone());
                Ok(budget)
            })
            .await?;
        info!("User {} created budget {}", user.id, budget.id);
        Ok(budget)
    }

    pub async fn rename_budget(&self, user: &AuthUser, budget_id: i64, name: &str) -> Result<Budget, BudgetError> {
        self.require_owner(user, budget_id).await?;
        self.validate_string_input("name", name, 100)?;
        let name = name.trim().to_string();
        self.storage
            .update(Collection::Budgets, |budgets: &mut BudgetSet| {
                let budget = budgets
                    .iter_mut()
                    .find(|b| b.id == budget_id)
                    .ok_or(BudgetError::BudgetNotFound(budget_id))?;
                budget.name = name;
                Ok(budget.clone())
            })
            .await
    }

    /// Owner-only. Hard-deletes the budget with its transactions, invitations and metadata.
    pub async fn delete_budget(&self, user: &AuthUser, budget_id: i64) -> Result<(), BudgetError> {
        self.require_owner(user, budget_id).await?;

        let removed = self
            .storage
            .update(Collection::Transactions, |all: &mut TransactionSet| {
                let before = all.len();
                all.retain(|t| t.budget_id != budget_id);
                Ok(before - all.len())
            })
            .await?;
        self.storage
            .update(Collection::Invitations, |invites: &mut InvitationSet| {
                invites.retain(|i| i.budget_id != budget_id);
                Ok(())
            })
            .await?;
        self.storage
            .update(Collection::BudgetMeta, |store: &mut MetaStore| {
                store.remove(&budget_id.to_string());
                Ok(())
            })
            .await?;
        self.storage
            .update(Collection::Budgets, |budgets: &mut BudgetSet| {
                budgets.retain(|b| b.id != budget_id);
                Ok(())
            })
            .await?;
        info!(
            "User {} deleted budget {} ({} transaction(s) removed)",
            user.id, budget_id, removed
        );
        Ok(())
    }

    // MEMBERS AND INVITATIONS

    /// Adds a registered user directly, otherwise leaves a pending invitation for the email.
    pub async fn add_member(
        &self,
        user: &AuthUser,
        budget_id: i64,
        email: &str,
        role: Role,
    ) -> Result<MemberOutcome, BudgetError> {
        self.require_owner(user, budget_id).await?;
        let email = email.trim().to_string();
        if email.is_empty() {
            return Err(BudgetError::MissingEmail);
        }

        let users: UserSet = self.storage.read(Collection::Users).await?;
        if let Some(invitee) = users.iter().find(|u| u.email.eq_ignore_ascii_case(&email)) {
            let invitee_id = invitee.id;
            self.storage
                .update(Collection::Budgets, |budgets: &mut BudgetSet| {
                    let budget = budgets
                        .iter_mut()
                        .find(|b| b.id == budget_id)
                        .ok_or(BudgetError::BudgetNotFound(budget_id))?;
                    if !budget.is_member(invitee_id) {
                        budget.members.push(BudgetMember {
                            user_id: invitee_id,
                            role,
                        });
                    }
                    Ok(())
                })
                .await?;
            info!("User {} added to budget {}", invitee_id, budget_id);
            return Ok(MemberOutcome::Added { user_id: invitee_id });
        }

        let token = Uuid::new_v4().simple().to_string();
        let now = now_millis();
        let expires_at = now + self.settings.invitation_ttl.num_milliseconds();
        let invited_by = user.id;
        let invitation_token = token.clone();
        self.storage
            .update(Collection::Invitations, |invites: &mut InvitationSet| {
                invites.push(Invitation {
                    id: invites.iter().map(|i| i.id).max().unwrap_or(0) + 1,
                    token: invitation_token,
                    budget_id,
                    email,
                    role,
                    invited_by,
                    status: InvitationStatus::Pending,
                    created_at: now,
                    expires_at,
                });
                Ok(())
            })
            .await?;
        info!("Invitation created for budget {}", budget_id);
        Ok(MemberOutcome::Invited { token })
    }

    pub async fn accept_invitation(&self, user: &AuthUser, token: &str) -> Result<i64, BudgetError> {
        let now = now_millis();
        let invitation = self
            .storage
            .update(Collection::Invitations, |invites: &mut InvitationSet| {
                let invitation = invites
                    .iter_mut()
                    .find(|i| i.token == token)
                    .ok_or(BudgetError::InvitationNotFound)?;
                if invitation.status != InvitationStatus::Pending {
                    return Err(BudgetError::InvitationAlreadyResolved(invitation.status.to_string()));
                }
                if invitation.is_expired(now) {
                    return Err(BudgetError::InvitationExpired);
                }
                invitation.status = InvitationStatus::Accepted;
                Ok(invitation.clone())
            })
            .await?;

        let user_id = user.id;
        self.storage
            .update(Collection::Budgets, |budgets: &mut BudgetSet| {
                let budget = budgets
                    .iter_mut()
                    .find(|b| b.id == invitation.budget_id)
                    .ok_or(BudgetError::BudgetNotFound(invitation.budget_id))?;
                if !budget.is_member(user_id) {
                    budget.members.push(BudgetMember {
                        user_id,
                        role: invitation.role,
                    });
                }
                Ok(())
            })
            .await?;
        info!("User {} joined budget {} by invitation", user.id, invitation.budget_id);
        Ok(invitation.budget_id)
    }

    pub async fn decline_invitation(&self, user: &AuthUser, token: &str) -> Result<(), BudgetError> {
        self.storage
            .update(Collection::Invitations, |invites: &mut InvitationSet| {
                let invitation = invites
                    .iter_mut()
                    .find(|i| i.token == token)
                    .ok_or(BudgetError::InvitationNotFound)?;
                if invitation.status != InvitationStatus::Pending {
                    return Err(BudgetError::InvitationAlreadyResolved(invitation.status.to_string()));
                }
                invitation.status = InvitationStatus::Declined;
                Ok(())
            })
            .await?;
        info!("User {} declined an invitation", user.id);
        Ok(())
    }

    // TRANSACTIONS

    /// Transactions of the budget that are not soft-deleted.
    pub async fn list_active(&self, user: &AuthUser, budget_id: i64) -> Result<Vec<Transaction>, BudgetError> {
        self.require_member(user, budget_id).await?;
        let all: TransactionSet = self.storage.read(Collection::Transactions).await?;
        Ok(all
            .into_iter()
            .filter(|t| t.budget_id == budget_id && t.is_active())
            .collect())
    }

    pub async fn create_transaction(
        &self,
        user: &AuthUser,
        budget_id: i64,
        fields: TransactionFields,
    ) -> Result<Transaction, BudgetError> {
        self.require_member(user, budget_id).await?;
        fields.validate()?;
        let created_by = user.id;
        let created = self
            .storage
            .update(Collection::Transactions, |all: &mut TransactionSet| {
                let content_hash = fields.content_hash();
                let key = fingerprint::dedup_key(budget_id, &content_hash, fields.amount, fields.date);
                let item = Transaction {
                    id: all.iter().map(|t| t.id).max().unwrap_or(0) + 1,
                    budget_id,
                    fields,
                    content_hash: Some(content_hash),
                    idempotency_key: Some(key),
                    deleted_at: None,
                    created_by: Some(created_by),
                    tombstoned_at: None,
                    tombstone_seq: None,
                };
                all.push(item.clone());
                Ok(item)
            })
            .await?;
        info!("User {} created transaction {} in budget {}", user.id, created.id, budget_id);
        self.notifier.broadcast(UpdatePayload {
            budget_id,
            id: Some(created.id),
            op: UpdateOp::Create,
            count: None,
        });
        Ok(created)
    }

    /// Reconciles a client batch against the authoritative set.
    ///
    /// An item whose `(budgetId, contentHash, amount, date)` key and idempotency key (or content
    /// hash) match an existing record is a duplicate, or an update when it carries a deletion
    /// the server has not seen. Everything else is created with the next sequential id and
    /// indexed at once, so repeats inside the same batch collapse too. The whole set is written
    /// once, then subscribers of the budget are notified.
    pub async fn bulk_upsert(
        &self,
        user: &AuthUser,
        budget_id: i64,
        items: Vec<BulkItem>,
    ) -> Result<BulkUpsertOutcome, BudgetError> {
        self.require_member(user, budget_id).await?;
        for item in &items {
            item.fields.validate()?;
        }
        let submitted = items.len();
        let created_by = user.id;
        let now = now_millis();

        let outcome = self
            .storage
            .update(Collection::Transactions, |all: &mut TransactionSet| {
                let mut index: HashMap<String, usize> = all
                    .iter()
                    .enumerate()
                    .map(|(pos, t)| (t.dedup_key(), pos))
                    .collect();
                let mut next_id = all.iter().map(|t| t.id).max().unwrap_or(0) + 1;
                let mut next_seq = next_tombstone_seq(all);
                let mut outcome = BulkUpsertOutcome::default();

                for item in items {
                    let content_hash = item
                        .content_hash
                        .clone()
                        .unwrap_or_else(|| item.fields.content_hash());
                    let key =
                        fingerprint::dedup_key(budget_id, &content_hash, item.fields.amount, item.fields.date);
                    let idempotency_key = item.idempotency_key.clone().unwrap_or_else(|| key.clone());

                    if let Some(&pos) = index.get(&key) {
                        let existing = &mut all[pos];
                        let same_submission = existing.idempotency_key.as_deref() == Some(idempotency_key.as_str())
                            || existing.effective_content_hash() == content_hash;
                        if same_submission {
                            if item.deleted_at.is_some() && existing.deleted_at.is_none() {
                                existing.deleted_at = item.deleted_at;
                                if existing.record_tombstone(next_seq, now) {
                                    next_seq += 1;
                                }
                                debug!("Bulk item propagated deletion of {}", existing.id);
                                outcome.updated.push(existing.clone());
                            } else {
                                outcome.duplicates.push(existing.clone());
                            }
                            outcome.mapping.push(IdMapping {
                                client_id: item.client_id,
                                server_id: existing.id,
                            });
                            continue;
                        }
                    }

                    let mut record = Transaction {
                        id: next_id,
                        budget_id,
                        fields: item.fields,
                        content_hash: Some(content_hash),
                        idempotency_key: Some(idempotency_key),
                        deleted_at: item.deleted_at,
                        created_by: Some(created_by),
                        tombstoned_at: None,
                        tombstone_seq: None,
                    };
                    next_id += 1;
                    if record.record_tombstone(next_seq, now) {
                        next_seq += 1;
                    }
                    outcome.mapping.push(IdMapping {
                        client_id: item.client_id,
                        server_id: record.id,
                    });
                    outcome.created.push(record.clone());
                    all.push(record);
                    index.insert(key, all.len() - 1);
                }
                Ok(outcome)
            })
            .await?;

        info!(
            "Bulk upsert into budget {} by user {}: {} submitted, {} created, {} duplicate, {} updated",
            budget_id,
            user.id,
            submitted,
            outcome.created.len(),
            outcome.duplicates.len(),
            outcome.updated.len()
        );
        self.notifier.broadcast(UpdatePayload {
            budget_id,
            id: None,
            op: UpdateOp::Bulk,
            count: Some(outcome.created.len()),
        });
        Ok(outcome)
    }

    /// Tombstones one record. Deleting twice returns the original `deletedAt` and notifies
    /// nobody.
    pub async fn soft_delete(&self, user: &AuthUser, id: i64) -> Result<SoftDeleteOutcome, BudgetError> {
        let all: TransactionSet = self.storage.read(Collection::Transactions).await?;
        let budget_id = all
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.budget_id)
            .ok_or(BudgetError::TransactionNotFound(id))?;
        self.require_member(user, budget_id).await?;

        let now = now_millis();
        let (outcome, newly_deleted) = self
            .storage
            .update(Collection::Transactions, |all: &mut TransactionSet| {
                let next_seq = next_tombstone_seq(all);
                let item = all
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or(BudgetError::TransactionNotFound(id))?;
                let newly_deleted = item.deleted_at.is_none();
                let deleted_at = *item.deleted_at.get_or_insert(now);
                item.record_tombstone(next_seq, now);
                Ok((SoftDeleteOutcome { id, deleted_at }, newly_deleted))
            })
            .await?;

        if !newly_deleted {
            debug!("Transaction {} was already deleted", id);
            return Ok(outcome);
        }
        info!("User {} soft-deleted transaction {} of budget {}", user.id, id, budget_id);
        self.notifier.broadcast(UpdatePayload {
            budget_id,
            id: Some(id),
            op: UpdateOp::SoftDelete,
            count: None,
        });
        Ok(outcome)
    }

    /// Deletions recorded after feed position `since`, within the retention horizon.
    ///
    /// Positions and ages come from the server, so a deletion made offline and uploaded late
    /// still lands after every cursor handed out before it.
    pub async fn list_tombstones(
        &self,
        user: &AuthUser,
        budget_id: i64,
        since: Option<i64>,
    ) -> Result<Vec<Tombstone>, BudgetError> {
        self.require_member(user, budget_id).await?;
        let horizon = now_millis() - self.settings.tombstone_horizon.num_milliseconds();
        let since = since.unwrap_or(i64::MIN);
        let all: TransactionSet = self.storage.read(Collection::Transactions).await?;
        let mut tombstones: Vec<Tombstone> = all
            .iter()
            .filter(|t| t.budget_id == budget_id)
            .filter_map(|t| {
                let deleted_at = t.deleted_at?;
                // Records written before feed positions existed sort first.
                let seq = t.tombstone_seq.unwrap_or(0);
                let recorded_at = t.tombstoned_at.unwrap_or(deleted_at);
                (seq > since && recorded_at >= horizon).then(|| Tombstone {
                    id: t.id,
                    content_hash: Some(t.effective_content_hash()),
                    deleted_at,
                    seq,
                })
            })
            .collect();
        tombstones.sort_by_key(|t| (t.seq, t.id));
        Ok(tombstones)
    }

    // METADATA

    pub async fn get_meta(&self, user: &AuthUser, budget_id: i64) -> Result<MetaBundle, BudgetError> {
        self.require_member(user, budget_id).await?;
        let store: MetaStore = self.storage.read(Collection::BudgetMeta).await?;
        Ok(store.get(&budget_id.to_string()).cloned().unwrap_or_default())
    }

    /// Replaces the whole bundle; the last writer wins.
    pub async fn put_meta(&self, user: &AuthUser, budget_id: i64, bundle: MetaBundle) -> Result<MetaBundle, BudgetError> {
        self.require_member(user, budget_id).await?;
        let next = MetaBundle {
            updated_at: now_millis(),
            ..bundle
        };
        let stored = next.clone();
        self.storage
            .update(Collection::BudgetMeta, |store: &mut MetaStore| {
                store.insert(budget_id.to_string(), stored);
                Ok(())
            })
            .await?;
        info!("User {} replaced metadata of budget {}", user.id, budget_id);
        self.notifier.broadcast(UpdatePayload {
            budget_id,
            id: None,
            op: UpdateOp::Meta,
            count: None,
        });
        Ok(next)
    }

    // SETTINGS

    /// The caller's stored settings, or an empty object.
    pub async fn get_settings(&self, user: &AuthUser) -> Result<Value, BudgetError> {
        let all: SettingsSet = self.storage.read(Collection::Settings).await?;
        Ok(all
            .into_iter()
            .find(|s| s.user_id == user.id)
            .map(|s| s.data)
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    pub async fn put_settings(&self, user: &AuthUser, data: Value) -> Result<Value, BudgetError> {
        let row = UserSettings {
            user_id: user.id,
            data: settings::normalize(data),
            updated_at: now_millis(),
        };
        let data = row.data.clone();
        self.storage
            .update(Collection::Settings, |all: &mut SettingsSet| {
                match all.iter_mut().find(|s| s.user_id == row.user_id) {
                    Some(existing) => *existing = row,
                    None => all.push(row),
                }
                Ok(())
            })
            .await?;
        debug!("User {} replaced settings", user.id);
        Ok(data)
    }

    // REAL-TIME

    /// Opens a change subscription after checking the token and budget membership.
    pub async fn subscribe(&self, token: &str, budget_id: i64) -> Result<Subscription, BudgetError> {
        let user = self.authenticate(token).await?;
        self.require_member(&user, budget_id).await?;
        let subscription = self.notifier.subscribe(budget_id)?;
        info!("User {} subscribed to budget {}", user.id, budget_id);
        Ok(subscription)
    }
}
