//! Synchronized table names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A backend table whose rows are cached and watched for changes.
///
/// The table name doubles as the cache `kind` for reads of the whole table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Family members.
    Members,
    /// Chores assigned within a family.
    Chores,
    /// Rewards that members can redeem points for.
    Rewards,
    /// Recorded chore completions.
    Completions,
}

impl Table {
    /// Every synchronized table, in a stable order.
    pub const ALL: [Table; 4] = [
        Table::Members,
        Table::Chores,
        Table::Rewards,
        Table::Completions,
    ];

    /// The backend name of this table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Members => "members",
            Table::Chores => "chores",
            Table::Rewards => "rewards",
            Table::Completions => "completions",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "members" => Ok(Table::Members),
            "chores" => Ok(Table::Chores),
            "rewards" => Ok(Table::Rewards),
            "completions" => Ok(Table::Completions),
            other => Err(Error::UnknownTable(other.to_string())),
        }
    }
}
