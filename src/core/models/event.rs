use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOp {
    Create,
    Bulk,
    SoftDelete,
    Meta,
}

/// Payload of an `update` event.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub budget_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub op: UpdateOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

/// Events delivered on a budget's real-time channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    Hello,
    Ping,
    Update(UpdatePayload),
}

impl ChangeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeEvent::Hello => "hello",
            ChangeEvent::Ping => "ping",
            ChangeEvent::Update(_) => "update",
        }
    }

    pub fn data(&self) -> String {
        match self {
            ChangeEvent::Hello => r#"{"status":"connected"}"#.to_string(),
            ChangeEvent::Ping => "{}".to_string(),
            ChangeEvent::Update(payload) => serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string()),
        }
    }

    /// Rebuild an event from its wire name and data. Unknown names yield `None`.
    pub fn parse(name: &str, data: &str) -> Option<Self> {
        match name {
            "hello" => Some(ChangeEvent::Hello),
            "ping" => Some(ChangeEvent::Ping),
            "update" => serde_json::from_str(data).ok().map(ChangeEvent::Update),
            _ => None,
        }
    }
}
