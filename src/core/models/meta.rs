use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Per-budget reference lists offered by the entry form.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetaBundle {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetaKind {
    Categories,
    Members,
    Sources,
}

impl MetaBundle {
    pub fn list(&self, kind: MetaKind) -> &Vec<String> {
        match kind {
            MetaKind::Categories => &self.categories,
            MetaKind::Members => &self.members,
            MetaKind::Sources => &self.sources,
        }
    }

    pub fn list_mut(&mut self, kind: MetaKind) -> &mut Vec<String> {
        match kind {
            MetaKind::Categories => &mut self.categories,
            MetaKind::Members => &mut self.members,
            MetaKind::Sources => &mut self.sources,
        }
    }

    /// Merge a server copy into `self` without letting an empty server list wipe local data.
    pub fn merge_from_server(&mut self, server: MetaBundle) {
        for kind in [MetaKind::Categories, MetaKind::Members, MetaKind::Sources] {
            let incoming = server.list(kind);
            if !incoming.is_empty() {
                *self.list_mut(kind) = incoming.clone();
            }
        }
        self.updated_at = self.updated_at.max(server.updated_at);
    }
}
