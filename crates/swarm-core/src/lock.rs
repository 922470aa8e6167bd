//! File-lock result types

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Result of a lock acquisition or conflict check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    /// Whether every requested path was free
    pub acquired: bool,
    /// Task holding the first conflicting lock
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_task: Option<String>,
    /// First path found to conflict; callers must not depend on which
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_file: Option<String>,
}

impl LockResult {
    /// All requested paths were free
    #[must_use]
    pub const fn acquired() -> Self {
        Self {
            acquired: true,
            conflicting_task: None,
            conflicting_file: None,
        }
    }

    /// A live lock on `path` is held by `task`
    #[must_use]
    pub fn conflict(task: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            acquired: false,
            conflicting_task: Some(task.into()),
            conflicting_file: Some(path.into()),
        }
    }

    /// Turn a conflict into its error kind
    ///
    /// # Errors
    ///
    /// `LockConflict` naming the holder and path when not acquired.
    pub fn into_result(self) -> Result<()> {
        if self.acquired {
            Ok(())
        } else {
            Err(Error::LockConflict {
                task: self.conflicting_task.unwrap_or_default(),
                path: self.conflicting_file.unwrap_or_default(),
            })
        }
    }
}
