use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status shared by actions and operations.
///
/// Transitions are monotonic: `New -> InProgress -> {Success, Failure}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Status {
    New = 0,
    InProgress = 1,
    Success = 2,
    Failure = 3,
}

impl Status {
    /// Whether the unit has reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::InProgress,
            2 => Self::Success,
            _ => Self::Failure,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
        })
    }
}

/// Business classification of an action or operation (type, category, group).
///
/// Services usually declare these as constants, hence `Cow<'static, str>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    /// Unit type, e.g. `"create_user"`.
    #[serde(rename = "type")]
    pub kind: Cow<'static, str>,
    pub category: Cow<'static, str>,
    pub group: Cow<'static, str>,
}

impl Descriptor {
    #[must_use]
    pub fn new(
        kind: impl Into<Cow<'static, str>>,
        category: impl Into<Cow<'static, str>>,
        group: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind: kind.into(),
            category: category.into(),
            group: group.into(),
        }
    }
}

/// One named operation parameter. Order of params is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: Cow<'static, str>,
    pub value: String,
}

impl Param {
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>, value: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_u8() {
        for status in [Status::New, Status::InProgress, Status::Success, Status::Failure] {
            assert_eq!(Status::from_u8(status as u8), status);
        }
        assert!(!Status::InProgress.is_terminal());
        assert!(Status::Failure.is_terminal());
    }

    #[test]
    fn descriptor_serializes_kind_as_type() {
        let descriptor = Descriptor::new("create_user", "identity", "users");
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["type"], "create_user");
        assert_eq!(json["category"], "identity");
        assert_eq!(json["group"], "users");
    }

    #[test]
    fn param_stringifies_value() {
        let param = Param::new("attempt", 3);
        assert_eq!(param.name, "attempt");
        assert_eq!(param.value, "3");
    }
}
