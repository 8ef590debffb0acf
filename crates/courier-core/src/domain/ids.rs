//! Task identifiers.
//!
//! Ids are ULIDs: the leading 48 bits are a millisecond timestamp, so ids
//! minted by the same store sort roughly by insertion time and can be
//! generated without coordination between processes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Identifier of a stored background task.
///
/// Assigned by the store on insert and never changed afterwards.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// The bare ULID string, as persisted by the SQLite store.
    pub fn to_storage_string(&self) -> String {
        self.0.to_string()
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl FromStr for TaskId {
    type Err = ulid::DecodeError;

    /// Accepts both the bare ULID and the `task-` display form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("task-").unwrap_or(s);
        Ulid::from_string(raw).map(Self)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_prefix() {
        let id = TaskId::from_ulid(Ulid::new());
        assert!(id.to_string().starts_with("task-"));
        assert!(!id.to_storage_string().starts_with("task-"));
    }

    #[test]
    fn parses_both_forms() {
        let id = TaskId::from_ulid(Ulid::new());
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert_eq!(id.to_storage_string().parse::<TaskId>().unwrap(), id);
        assert!("task-not-a-ulid".parse::<TaskId>().is_err());
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());
        assert!(id1 < id2);
    }

    #[test]
    fn same_size_as_ulid() {
        assert_eq!(std::mem::size_of::<TaskId>(), std::mem::size_of::<Ulid>());
    }
}
