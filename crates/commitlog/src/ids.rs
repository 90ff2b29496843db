use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

/// Top-level isolation boundary for the commit-seq namespace and scopes
/// (spec.md GLOSSARY "Partition"). Defaults to `"default"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub String);

impl PartitionId {
    pub fn default_partition() -> Self {
        PartitionId("default".to_string())
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        Self::default_partition()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        PartitionId(value.to_string())
    }
}

/// Dense monotonic commit identifier scoped to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitSeq(pub i64);

impl CommitSeq {
    /// Sentinel meaning "no commits yet" / "start from the beginning".
    pub const NONE: CommitSeq = CommitSeq(0);

    pub fn next(self) -> CommitSeq {
        CommitSeq(self.0 + 1)
    }
}

impl fmt::Display for CommitSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense monotonic change identifier, unique within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeId(pub i64);

impl ChangeId {
    pub fn next(self) -> ChangeId {
        ChangeId(self.0 + 1)
    }
}
