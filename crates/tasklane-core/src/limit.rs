use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Either no cap at all or a fixed count. Used for run caps and retry budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Unlimited,
    Limited(u32),
}

impl Limit {
    /// `Limited(0)`: nothing left.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Limit::Limited(0))
    }

    /// Whether `count` has reached the cap.
    pub fn reached(&self, count: u32) -> bool {
        match self {
            Limit::Unlimited => false,
            Limit::Limited(max) => count >= *max,
        }
    }

    /// Consume one unit. Saturates at zero; `Unlimited` stays unlimited.
    pub fn decrement(&mut self) {
        if let Limit::Limited(n) = self {
            *n = n.saturating_sub(1);
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "unlimited"),
            Limit::Limited(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for Limit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unlimited" => Ok(Limit::Unlimited),
            other => other
                .parse::<u32>()
                .map(Limit::Limited)
                .map_err(|e| format!("expected \"unlimited\" or a count, got {other:?}: {e}")),
        }
    }
}
