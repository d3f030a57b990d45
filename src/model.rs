//! Wire types shared by the proxy and the dashboard client.
//!
//! All JSON field names follow the external queue processor (camelCase).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ===============================
/// Scope
/// ===============================

/// `(tenant, service)` pair every queue operation is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub tenant: String,
    pub service: String,
}

impl Scope {
    pub fn new(tenant: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            service: service.into(),
        }
    }

    /// Room identifier used by the event channel.
    pub fn room(&self) -> String {
        format!("{}:{}", self.tenant, self.service)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.service)
    }
}

/// ===============================
/// Queue
/// ===============================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    /// Upload the file, then add it to the server config.
    Add,
    AddNoUpload,
    Remove,
    AddSpawner,
    AddPra,
    AddSpawngear,
    RemoveSpawner,
    RemovePra,
    RemoveSpawngear,
    ApplySettings,
}

impl QueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAction::Add => "add",
            QueueAction::AddNoUpload => "add_no_upload",
            QueueAction::Remove => "remove",
            QueueAction::AddSpawner => "add_spawner",
            QueueAction::AddPra => "add_pra",
            QueueAction::AddSpawngear => "add_spawngear",
            QueueAction::RemoveSpawner => "remove_spawner",
            QueueAction::RemovePra => "remove_pra",
            QueueAction::RemoveSpawngear => "remove_spawngear",
            QueueAction::ApplySettings => "apply_settings",
        }
    }

    /// Kind-specific add action enqueued after a successful upload.
    pub fn add_for(kind: FileKind) -> Self {
        match kind {
            FileKind::Spawner => QueueAction::AddSpawner,
            FileKind::Pra => QueueAction::AddPra,
            FileKind::Spawngear => QueueAction::AddSpawngear,
        }
    }
}

impl fmt::Display for QueueAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub file_name: String,
    pub action: QueueAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// How a queued item is addressed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemRef {
    Id(String),
    /// Positional fallback for items the processor has not assigned an id to.
    Index(usize),
}

impl ItemRef {
    /// Prefer the server-assigned id, fall back to the position.
    pub fn for_item(item: &QueueItem, index: usize) -> Self {
        match &item.id {
            Some(id) => ItemRef::Id(id.clone()),
            None => ItemRef::Index(index),
        }
    }

    pub fn path_segment(&self) -> String {
        match self {
            ItemRef::Id(id) => id.clone(),
            ItemRef::Index(i) => i.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddQueueItem {
    pub file_name: String,
    pub action: QueueAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateQueueItem {
    pub action: QueueAction,
}

/// Body returned by every queue read and mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue: Vec<QueueItem>,
}

/// ===============================
/// Processing status
/// ===============================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    #[default]
    Idle,
    Processing,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub status: ProcessingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub queue_length: usize,
}

impl ProcessingStatus {
    pub fn is_processing(&self) -> bool {
        self.status == ProcessingState::Processing
    }
}

/// ===============================
/// Files
/// ===============================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Player restricted area file.
    Pra,
    /// Loot / gear preset.
    Spawngear,
    /// Generic object spawner file.
    Spawner,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Pra => "pra",
            FileKind::Spawngear => "spawngear",
            FileKind::Spawner => "spawner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pra" => Some(FileKind::Pra),
            "spawngear" => Some(FileKind::Spawngear),
            "spawner" => Some(FileKind::Spawner),
            _ => None,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePartition {
    /// Candidates available to add.
    #[serde(default)]
    pub remote_not_in_config: Vec<String>,
    /// Candidates available to remove.
    #[serde(default, alias = "cfgNotOnRemote")]
    pub cfg_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileCatalog {
    #[serde(default)]
    pub spawner: FilePartition,
    #[serde(default)]
    pub pra: FilePartition,
    #[serde(default)]
    pub spawngear: FilePartition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_accepts_cfg_not_on_remote_alias() {
        let raw = r#"{
            "pra": { "remoteNotInConfig": ["a.json"], "cfgNotOnRemote": ["b.json"] },
            "spawner": { "remoteNotInConfig": [], "cfgFiles": ["c.json"] }
        }"#;
        let catalog: FileCatalog = serde_json::from_str(raw).unwrap();
        assert_eq!(catalog.pra.cfg_files, vec!["b.json"]);
        assert_eq!(catalog.spawner.cfg_files, vec!["c.json"]);
        assert!(catalog.spawngear.remote_not_in_config.is_empty());
    }

    #[test]
    fn queue_item_wire_format() {
        let raw = r#"{"fileName":"Flag_White","action":"remove"}"#;
        let item: QueueItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.action, QueueAction::Remove);
        assert_eq!(ItemRef::for_item(&item, 4), ItemRef::Index(4));

        let with_id = QueueItem { id: Some("q1".into()), ..item };
        assert_eq!(ItemRef::for_item(&with_id, 4).path_segment(), "q1");
    }

    #[test]
    fn status_parses_lowercase_state() {
        let s: ProcessingStatus =
            serde_json::from_str(r#"{"status":"processing","queueLength":3}"#).unwrap();
        assert!(s.is_processing());
        assert_eq!(s.queue_length, 3);
    }
}
