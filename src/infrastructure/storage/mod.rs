use crate::core::errors::BudgetError;
use crate::core::models::{
    budget::Budget, invitation::Invitation, meta::MetaBundle, settings::UserSettings, transaction::Transaction,
    user::User,
};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;

pub type TransactionSet = Vec<Transaction>;
/// Metadata bundles keyed by budget id rendered as a string.
pub type MetaStore = BTreeMap<String, MetaBundle>;
pub type UserSet = Vec<User>;
pub type BudgetSet = Vec<Budget>;
pub type InvitationSet = Vec<Invitation>;
pub type SettingsSet = Vec<UserSettings>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    Transactions,
    BudgetMeta,
    Users,
    Budgets,
    Invitations,
    Settings,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Transactions,
        Collection::BudgetMeta,
        Collection::Users,
        Collection::Budgets,
        Collection::Invitations,
        Collection::Settings,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Collection::Transactions => "transactions.json",
            Collection::BudgetMeta => "budget_meta.json",
            Collection::Users => "users.json",
            Collection::Budgets => "budgets.json",
            Collection::Invitations => "invitations.json",
            Collection::Settings => "settings.json",
        }
    }
}

/// Whole-collection persistence.
///
/// Every collection is loaded, mutated in memory and saved back as one unit. Implementations
/// hold a per-collection lock for the full duration of `update`, so concurrent writers are
/// serialized instead of overwriting each other's snapshot. When `mutate` returns an error
/// nothing is written.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read<T>(&self, collection: Collection) -> Result<T, BudgetError>
    where
        T: DeserializeOwned + Default + Send;

    async fn update<T, R, F>(&self, collection: Collection, mutate: F) -> Result<R, BudgetError>
    where
        T: Serialize + DeserializeOwned + Default + Send,
        R: Send,
        F: FnOnce(&mut T) -> Result<R, BudgetError> + Send;
}

pub mod in_memory;
pub mod json_file;
