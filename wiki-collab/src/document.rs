//! Document identifiers.
//!
//! A document name is the correlation key shared by the relational store,
//! the snapshot cache and the sync channels:
//!
//! ```text
//! page.6f1c0a4e-3b5e-4b8e-9d7a-2f1e0c9b8a77
//! └┬─┘ └──────────────────┬───────────────┘
//!  kind                  entity id
//! ```
//!
//! A bare UUID without a kind prefix is read as a page id.

use std::fmt;
use uuid::Uuid;

/// Entity kinds that can be edited collaboratively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Page,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Page => "page",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "page" => Some(EntityKind::Page),
            _ => None,
        }
    }
}

/// Parsed `<kind>.<id>` document name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentName {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl DocumentName {
    pub fn page(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Page,
            id,
        }
    }

    /// Parse a document name. Returns `None` for unknown kinds or bad ids.
    pub fn parse(name: &str) -> Option<Self> {
        match name.split_once('.') {
            Some((kind, id)) => Some(Self {
                kind: EntityKind::parse(kind)?,
                id: Uuid::parse_str(id).ok()?,
            }),
            None => Uuid::parse_str(name).ok().map(Self::page),
        }
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.as_str(), self.id)
    }
}
