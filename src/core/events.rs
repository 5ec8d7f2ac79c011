//! Fleet events delivered on control-plane subscriptions.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::models::{ServerStatus, Tool};

/// Tagged event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    ServerStatus {
        name: String,
        old: ServerStatus,
        new: ServerStatus,
    },
    ToolUpdate {
        name: String,
        count: usize,
        tools: Vec<Tool>,
    },
    ConfigChange {
        added: Vec<String>,
        removed: Vec<String>,
        modified: Vec<String>,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::ServerStatus { .. } => EventType::ServerStatus,
            EventKind::ToolUpdate { .. } => EventType::ToolUpdate,
            EventKind::ConfigChange { .. } => EventType::ConfigChange,
        }
    }
}

/// An event with its wall-clock timestamp (unix seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: i64,
}

impl FleetEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn status_change(name: &str, old: ServerStatus, new: ServerStatus) -> Self {
        Self::now(EventKind::ServerStatus {
            name: name.to_string(),
            old,
            new,
        })
    }
}

/// Subscribable event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    All,
    ServerStatus,
    ToolUpdate,
    ConfigChange,
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(EventType::All),
            "server_status" => Ok(EventType::ServerStatus),
            "tool_update" => Ok(EventType::ToolUpdate),
            "config_change" => Ok(EventType::ConfigChange),
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

/// A subscriber's requested event-type set. Empty means everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter(Vec<EventType>);

impl EventFilter {
    pub fn new(types: Vec<EventType>) -> Self {
        Self(types)
    }

    /// Parse a comma-separated list, e.g. `server_status,tool_update`.
    /// Unknown entries are rejected.
    pub fn parse(list: &str) -> Result<Self, String> {
        let trimmed = list.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let types = trimmed
            .split(',')
            .map(|t| t.trim().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(types))
    }

    pub fn matches(&self, kind: &EventKind) -> bool {
        if self.0.is_empty() || self.0.contains(&EventType::All) {
            return true;
        }
        self.0.contains(&kind.event_type())
    }
}

/// Per-field catalog change set produced by a reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event() -> EventKind {
        EventKind::ServerStatus {
            name: "fs".into(),
            old: ServerStatus::Stopped,
            new: ServerStatus::Starting,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = EventFilter::default();
        assert!(f.matches(&status_event()));
        assert!(f.matches(&EventKind::ConfigChange {
            added: vec![],
            removed: vec![],
            modified: vec![],
        }));
    }

    #[test]
    fn all_filter_matches_everything() {
        let f = EventFilter::parse("all").unwrap();
        assert!(f.matches(&status_event()));
    }

    #[test]
    fn narrow_filter_excludes_other_kinds() {
        let f = EventFilter::parse("tool_update").unwrap();
        assert!(!f.matches(&status_event()));
        assert!(f.matches(&EventKind::ToolUpdate {
            name: "fs".into(),
            count: 1,
            tools: vec![],
        }));
    }

    #[test]
    fn parse_rejects_unknown_types() {
        assert!(EventFilter::parse("server_status,bogus").is_err());
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let ev = FleetEvent::status_change("fs", ServerStatus::Running, ServerStatus::Stopping);
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["kind"], "server_status");
        assert_eq!(value["name"], "fs");
        assert_eq!(value["old"], "running");
        assert_eq!(value["new"], "stopping");
        assert!(value["timestamp"].is_i64());
    }
}
