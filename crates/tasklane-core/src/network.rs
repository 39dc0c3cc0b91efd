use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Connectivity class reported by the host's reachability detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Offline,
    Cellular,
    Wifi,
}

/// Minimum connectivity a job needs before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRequirement {
    #[default]
    None,
    Any,
    Wifi,
}

impl NetworkRequirement {
    pub fn is_met_by(&self, connectivity: Connectivity) -> bool {
        match self {
            NetworkRequirement::None => true,
            NetworkRequirement::Any => connectivity != Connectivity::Offline,
            NetworkRequirement::Wifi => connectivity == Connectivity::Wifi,
        }
    }
}

impl fmt::Display for NetworkRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkRequirement::None => "none",
            NetworkRequirement::Any => "any",
            NetworkRequirement::Wifi => "wifi",
        };
        write!(f, "{s}")
    }
}

impl FromStr for NetworkRequirement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(NetworkRequirement::None),
            "any" => Ok(NetworkRequirement::Any),
            "wifi" => Ok(NetworkRequirement::Wifi),
            other => Err(format!("unknown network requirement: {other}")),
        }
    }
}
