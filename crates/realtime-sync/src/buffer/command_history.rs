use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::BufferItem;

/// Identity of an issued command. Ordered by generation time, then origin,
/// then sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandId {
    #[serde(with = "time::serde::rfc3339")]
    pub generation_time: OffsetDateTime,
    pub origin: String,
    pub sequence_number: i64,
}

/// One command history entry as carried by `CMD_HISTORY` frames and the
/// archive listing. Later frames for the same command carry the full,
/// updated attribute set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHistoryRecord {
    #[serde(rename = "commandId")]
    pub id: CommandId,
    pub command_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl CommandHistoryRecord {
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

impl BufferItem for CommandHistoryRecord {
    type Key = CommandId;

    fn key(&self) -> CommandId {
        self.id.clone()
    }

    /// Newest first.
    fn order(&self, other: &Self) -> Ordering {
        other.id.cmp(&self.id)
    }
}
