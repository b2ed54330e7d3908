use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "8m")]
    M8,
    #[serde(rename = "10m")]
    M10,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
}

impl Resolution {
    pub const ALL: [Resolution; 15] = [
        Resolution::M1,
        Resolution::M3,
        Resolution::M5,
        Resolution::M8,
        Resolution::M10,
        Resolution::M15,
        Resolution::M30,
        Resolution::H1,
        Resolution::H2,
        Resolution::H4,
        Resolution::H6,
        Resolution::H12,
        Resolution::D1,
        Resolution::D3,
        Resolution::W1,
    ];

    /// Timeframes derived from a 1m base series by default.
    pub const DERIVED: [Resolution; 14] = [
        Resolution::M3,
        Resolution::M5,
        Resolution::M8,
        Resolution::M10,
        Resolution::M15,
        Resolution::M30,
        Resolution::H1,
        Resolution::H2,
        Resolution::H4,
        Resolution::H6,
        Resolution::H12,
        Resolution::D1,
        Resolution::D3,
        Resolution::W1,
    ];

    pub fn seconds(&self) -> i64 {
        match self {
            Resolution::M1 => 60,
            Resolution::M3 => 180,
            Resolution::M5 => 300,
            Resolution::M8 => 480,
            Resolution::M10 => 600,
            Resolution::M15 => 900,
            Resolution::M30 => 1800,
            Resolution::H1 => 3600,
            Resolution::H2 => 7200,
            Resolution::H4 => 14400,
            Resolution::H6 => 21600,
            Resolution::H12 => 43200,
            Resolution::D1 => 86400,
            Resolution::D3 => 259200,
            Resolution::W1 => 604800,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Resolution::M1 => "1m",
            Resolution::M3 => "3m",
            Resolution::M5 => "5m",
            Resolution::M8 => "8m",
            Resolution::M10 => "10m",
            Resolution::M15 => "15m",
            Resolution::M30 => "30m",
            Resolution::H1 => "1h",
            Resolution::H2 => "2h",
            Resolution::H4 => "4h",
            Resolution::H6 => "6h",
            Resolution::H12 => "12h",
            Resolution::D1 => "1d",
            Resolution::D3 => "3d",
            Resolution::W1 => "1w",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        let normalized = value.trim().to_lowercase();
        let resolution = match normalized.as_str() {
            "1m" | "1min" => Resolution::M1,
            "3m" | "3min" => Resolution::M3,
            "5m" | "5min" | "5mins" => Resolution::M5,
            "8m" | "8min" => Resolution::M8,
            "10m" | "10min" => Resolution::M10,
            "15m" | "15min" | "15mins" => Resolution::M15,
            "30m" | "30min" | "30mins" => Resolution::M30,
            "1h" | "1hour" => Resolution::H1,
            "2h" | "2hour" => Resolution::H2,
            "4h" | "4hour" | "4hours" => Resolution::H4,
            "6h" | "6hour" => Resolution::H6,
            "12h" | "12hour" => Resolution::H12,
            "1d" | "1day" => Resolution::D1,
            "3d" | "3day" => Resolution::D3,
            "1w" | "1week" => Resolution::W1,
            _ => {
                let seconds = parse_duration_like_seconds(&normalized)
                    .map_err(|_| format!("unsupported resolution: {value}"))?;
                return Self::from_seconds(seconds)
                    .ok_or_else(|| format!("unsupported resolution: {value}"));
            }
        };
        Ok(resolution)
    }

    pub fn from_seconds(seconds: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.seconds() == seconds)
    }

    /// Floors `ts` to the start of its bucket. Buckets are aligned to the unix epoch.
    pub fn align(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.seconds())
    }

    pub fn is_aligned(&self, ts: i64) -> bool {
        ts.rem_euclid(self.seconds()) == 0
    }

    /// True when `coarser` buckets are made of a whole number of `self` buckets.
    pub fn divides(&self, coarser: Resolution) -> bool {
        coarser.seconds() >= self.seconds() && coarser.seconds() % self.seconds() == 0
    }

    pub fn buckets_in(&self, coarser: Resolution) -> Option<i64> {
        if self.divides(coarser) {
            Some(coarser.seconds() / self.seconds())
        } else {
            None
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub fn parse_duration_like_seconds(value: &str) -> Result<i64, String> {
    let trimmed = value.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Ok(seconds);
    }

    let (number_part, unit) = if let Some(stripped) = trimmed.strip_suffix("min") {
        (stripped, "min")
    } else if let Some(stripped) = trimmed.strip_suffix("hour") {
        (stripped, "hour")
    } else if let Some(stripped) = trimmed.strip_suffix("day") {
        (stripped, "day")
    } else if let Some(stripped) = trimmed.strip_suffix("week") {
        (stripped, "week")
    } else {
        trimmed.split_at(trimmed.len().saturating_sub(1))
    };

    let multiplier = match unit {
        "s" => 1,
        "m" | "min" => 60,
        "h" | "hour" => 3600,
        "d" | "day" => 86400,
        "w" | "week" => 604800,
        _ => return Err(format!("unsupported duration unit: {unit}")),
    };

    let number: i64 = number_part
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("duration out of range: {value}"))
}
