use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Editor,
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetMember {
    pub user_id: i64,
    #[serde(default)]
    pub role: Role,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    #[serde(default)]
    pub members: Vec<BudgetMember>,
    pub created_at: i64,
}

impl Budget {
    pub fn is_owner(&self, user_id: i64) -> bool {
        self.owner_id == user_id
    }

    /// Owner has implicit membership.
    pub fn is_member(&self, user_id: i64) -> bool {
        self.is_owner(user_id) || self.members.iter().any(|m| m.user_id == user_id)
    }
}
