use serde_derive::{Deserialize, Serialize};

/// Whether a layer is shared system state or per-user state. SYSTEM
/// layers outrank USER layers during read resolution regardless of their
/// numeric priority.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    System,
    User,
}

/// The persistence backing a layer, selected by string identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Table,
    Memory,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Table => "table",
            BackendKind::Memory => "memory",
        }
    }

    pub fn from_name(name: &str) -> Option<BackendKind> {
        match name {
            "table" => Some(BackendKind::Table),
            "memory" => Some(BackendKind::Memory),
            _ => None,
        }
    }
}

/// A named, prioritized namespace backed by a single backend. Layers are
/// created from configuration at daemon start and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub backend: BackendKind,
    pub priority: u32,
    #[serde(default)]
    pub description: Option<String>,
}

impl Layer {
    /// The database name for this layer as seen by a given caller: USER
    /// layers resolve to a per-uid database.
    pub fn database_name(&self, uid: u32) -> String {
        match self.kind {
            LayerKind::System => self.name.clone(),
            LayerKind::User => format!("{}-{}", self.name, uid),
        }
    }

    /// True when `self` wins over `other` under the priority rule:
    /// SYSTEM beats USER, then higher priority, then the
    /// lexicographically smaller name for a stable tie-break.
    pub fn outranks(&self, other: &Layer) -> bool {
        if self.kind != other.kind {
            return self.kind == LayerKind::System;
        }
        if self.priority != other.priority {
            return self.priority > other.priority;
        }
        self.name < other.name
    }
}
