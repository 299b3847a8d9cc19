//! Typed records persisted through the document repository.

pub mod queue;
pub mod suite;
pub mod task;

pub use self::queue::EndpointQueue;
pub use self::suite::{TestSuite, TestSuitePatch};
pub use self::task::{Outcome, Task, TaskStatus};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Dispatch tier of a task (lower number = served first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 3;

    pub const HIGH: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);

    /// Every level, in the order a claim scans them.
    pub const ALL: [Priority; 3] = [Self::HIGH, Self::NORMAL, Self::LOW];

    pub fn new(level: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&level) {
            Ok(Self(level))
        } else {
            Err(DispatchError::validation(
                "priority",
                format!("{level} is outside {}..={}", Self::MIN, Self::MAX),
            ))
        }
    }

    pub fn level(self) -> u8 {
        self.0
    }

    /// Zero-based lane index inside an [`EndpointQueue`].
    pub(crate) fn index(self) -> usize {
        usize::from(self.0 - Self::MIN)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = DispatchError;

    fn try_from(level: u8) -> Result<Self> {
        Self::new(level)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trim and check an endpoint address such as `10.0.0.5:8270`.
pub fn normalize_endpoint(address: &str) -> Result<String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(DispatchError::validation(
            "endpoint_address",
            "must not be empty",
        ));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(DispatchError::validation(
            "endpoint_address",
            format!("'{trimmed}' contains whitespace"),
        ));
    }
    Ok(trimmed.to_string())
}
