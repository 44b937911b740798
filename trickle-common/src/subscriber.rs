//! Subscriber vocabulary shared by the scheduler, the stores and the
//! authoritative subscriber source.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{ParseError, SubscriberId};

/// Lifecycle state of a subscriber.
///
/// Only [`SubscriberStatus::Active`] subscribers are ever scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    Inactive,
    Paused,
    Unsubscribed,
    Bounced,
    Pending,
    CapturedOffline,
}

impl SubscriberStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Paused => "paused",
            Self::Unsubscribed => "unsubscribed",
            Self::Bounced => "bounced",
            Self::Pending => "pending",
            Self::CapturedOffline => "captured_offline",
        }
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for SubscriberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriberStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "paused" => Ok(Self::Paused),
            "unsubscribed" => Ok(Self::Unsubscribed),
            "bounced" => Ok(Self::Bounced),
            "pending" => Ok(Self::Pending),
            "captured_offline" => Ok(Self::CapturedOffline),
            other => Err(ParseError::SubscriberStatus(other.to_string())),
        }
    }
}

/// How often a subscriber receives drip content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    #[default]
    Monthly,
}

impl Frequency {
    /// Distance between two sends at this frequency.
    #[must_use]
    pub const fn interval(self) -> Duration {
        match self {
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::days(7),
            Self::Monthly => Duration::days(30),
        }
    }

    /// Next send time when a subscriber is processed at `now`.
    ///
    /// Computed from `now` rather than the previous schedule, so missed ticks
    /// never compound into a backlog.
    #[must_use]
    pub fn next_after(self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.interval()
    }

    /// Lenient parse: anything unrecognised is monthly.
    #[must_use]
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Self::Daily,
            "weekly" => Self::Weekly,
            _ => Self::Monthly,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category of mail a subscriber may opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    Letters,
    Newsletters,
}

impl Preference {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Letters => "letters",
            Self::Newsletters => "newsletters",
        }
    }
}

impl FromStr for Preference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "letters" => Ok(Self::Letters),
            "newsletters" => Ok(Self::Newsletters),
            other => Err(ParseError::Preference(other.to_string())),
        }
    }
}

/// The subset of [`Preference`]s a subscriber has opted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub letters: bool,
    #[serde(default)]
    pub newsletters: bool,
}

impl Preferences {
    /// Opted into everything
    #[must_use]
    pub const fn all() -> Self {
        Self {
            letters: true,
            newsletters: true,
        }
    }

    #[must_use]
    pub const fn only(preference: Preference) -> Self {
        match preference {
            Preference::Letters => Self {
                letters: true,
                newsletters: false,
            },
            Preference::Newsletters => Self {
                letters: false,
                newsletters: true,
            },
        }
    }

    #[must_use]
    pub const fn contains(self, preference: Preference) -> bool {
        match preference {
            Preference::Letters => self.letters,
            Preference::Newsletters => self.newsletters,
        }
    }

    /// Parse the comma separated storage form, e.g. `letters,newsletters`.
    ///
    /// Unknown entries are ignored.
    #[must_use]
    pub fn parse_list(s: &str) -> Self {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .filter_map(|part| part.parse::<Preference>().ok())
            .fold(Self::default(), |mut acc, preference| {
                match preference {
                    Preference::Letters => acc.letters = true,
                    Preference::Newsletters => acc.newsletters = true,
                }
                acc
            })
    }

    /// Comma separated storage form
    #[must_use]
    pub fn to_list(self) -> String {
        let mut parts = Vec::with_capacity(2);
        if self.letters {
            parts.push(Preference::Letters.as_str());
        }
        if self.newsletters {
            parts.push(Preference::Newsletters.as_str());
        }
        parts.join(",")
    }
}

/// A subscriber as held by the owning content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub id: SubscriberId,
    pub email: String,
    pub status: SubscriberStatus,
    /// Whether the address was confirmed through the verification mail
    pub verified: bool,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub preferences: Preferences,
    /// Whether the subscriber answered the most recent re-consent request
    #[serde(default)]
    pub consent_confirmed: bool,
    pub updated_at: DateTime<Utc>,
}

impl SubscriberRecord {
    /// Active and verified, i.e. eligible for drip mail.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.status.is_active() && self.verified
    }
}
