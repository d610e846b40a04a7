use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Endpoint selection strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceMode {
    /// Always the first candidate in canonical order
    #[default]
    PickFirst,
    /// Smooth weighted round robin over the candidates' static weights
    #[serde(alias = "smooth_weighted_round_robin", alias = "roundrobin")]
    RoundRobin,
}

impl LoadBalanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceMode::PickFirst => "pick_first",
            LoadBalanceMode::RoundRobin => "round_robin",
        }
    }
}

impl fmt::Display for LoadBalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pick_first" | "pickfirst" | "first" => Ok(LoadBalanceMode::PickFirst),
            "round_robin" | "roundrobin" | "smooth_weighted_round_robin" | "wrr" => {
                Ok(LoadBalanceMode::RoundRobin)
            }
            other => Err(format!("unknown load balance mode: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("pick_first".parse::<LoadBalanceMode>(), Ok(LoadBalanceMode::PickFirst));
        assert_eq!("RoundRobin".parse::<LoadBalanceMode>(), Ok(LoadBalanceMode::RoundRobin));
        assert_eq!("wrr".parse::<LoadBalanceMode>(), Ok(LoadBalanceMode::RoundRobin));
        assert!("random".parse::<LoadBalanceMode>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&LoadBalanceMode::RoundRobin).unwrap();
        assert_eq!(json, "\"round_robin\"");
        let mode: LoadBalanceMode = serde_json::from_str("\"roundrobin\"").unwrap();
        assert_eq!(mode, LoadBalanceMode::RoundRobin);
    }

    #[test]
    fn test_default_is_pick_first() {
        assert_eq!(LoadBalanceMode::default(), LoadBalanceMode::PickFirst);
        assert_eq!(LoadBalanceMode::default().to_string(), "pick_first");
    }
}
