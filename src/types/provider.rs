use crate::error::KeeperError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OAuth providers a user can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Airtable,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Gmail, Provider::Airtable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Airtable => "airtable",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" => Ok(Provider::Gmail),
            "airtable" => Ok(Provider::Airtable),
            other => Err(KeeperError::UnknownProvider(other.to_string())),
        }
    }
}
