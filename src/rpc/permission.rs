//! Permission levels for invoke and set.
//!
//! Levels are totally ordered: `none < list < read < write < config < never`.
//! `never` marks an operation nobody may perform.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    None,
    List,
    #[default]
    Read,
    Write,
    Config,
    Never,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::List => "list",
            Self::Read => "read",
            Self::Write => "write",
            Self::Config => "config",
            Self::Never => "never",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "list" => Some(Self::List),
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "config" => Some(Self::Config),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

/// Whether a caller holding `actual` may perform an operation requiring
/// `required`.
pub fn has_permission(required: Permission, actual: Permission) -> bool {
    required != Permission::Never && actual != Permission::Never && actual >= required
}

/// Effective level for a request: the session grant capped by the
/// request's own `permit` field, if any.
pub fn effective(granted: Permission, permit: Option<Permission>) -> Permission {
    permit.map_or(granted, |p| p.min(granted))
}
