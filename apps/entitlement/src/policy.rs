use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const TIER_ANONYMOUS: &str = "anonymous";
pub const TIER_FREE: &str = "free";
pub const TIER_PRO: &str = "pro";
pub const TIER_UNLIMITED: &str = "unlimited";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Lifetime,
    CalendarMonth,
}

impl WindowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lifetime => "lifetime",
            Self::CalendarMonth => "calendar_month",
        }
    }

    /// First instant that counts toward the window containing `now`.
    pub fn window_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Lifetime => DateTime::UNIX_EPOCH,
            // Falling back to the epoch over-counts, which can only deny.
            Self::CalendarMonth => {
                month_start(now.year(), now.month()).unwrap_or(DateTime::UNIX_EPOCH)
            }
        }
    }

    /// Instant at which the window containing `now` resets, if it ever does.
    pub fn reset_at(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Lifetime => None,
            Self::CalendarMonth => {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                month_start(year, month)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLimit {
    Unlimited,
    Count(u64),
}

impl UsageLimit {
    pub fn as_count(self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::Count(limit) => Some(limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyWindow {
    pub tier: String,
    pub limit: UsageLimit,
    pub window: WindowKind,
}

/// Per-tier limits that operators may override; window kinds are fixed per tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyLimits {
    pub anonymous: u64,
    pub free: u64,
    pub pro: u64,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            anonymous: 1,
            free: 3,
            pro: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyTable {
    windows: BTreeMap<String, PolicyWindow>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::from_limits(&PolicyLimits::default())
    }
}

impl PolicyTable {
    pub fn from_limits(limits: &PolicyLimits) -> Self {
        let windows = [
            (TIER_ANONYMOUS, UsageLimit::Count(limits.anonymous), WindowKind::Lifetime),
            (TIER_FREE, UsageLimit::Count(limits.free), WindowKind::Lifetime),
            (TIER_PRO, UsageLimit::Count(limits.pro), WindowKind::CalendarMonth),
            (TIER_UNLIMITED, UsageLimit::Unlimited, WindowKind::Lifetime),
        ]
        .into_iter()
        .map(|(tier, limit, window)| {
            (
                tier.to_string(),
                PolicyWindow {
                    tier: tier.to_string(),
                    limit,
                    window,
                },
            )
        })
        .collect();
        Self { windows }
    }

    pub fn lookup(&self, tier: &str) -> Option<&PolicyWindow> {
        self.windows.get(normalize_tier(tier).as_str())
    }

    pub fn contains(&self, tier: &str) -> bool {
        self.lookup(tier).is_some()
    }

    pub fn tiers(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }
}

pub fn normalize_tier(tier: &str) -> String {
    tier.trim().to_ascii_lowercase()
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
