//! Queue, log and analytics vocabularies.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// Template names attached to queued jobs.
pub mod templates {
    pub const VERIFICATION: &str = "verification";
    pub const WELCOME: &str = "welcome";
    pub const RECONSENT: &str = "reconsent";
    pub const TEST: &str = "test";
    pub const LETTER: &str = "letter";
    pub const CAUGHT_UP: &str = "caught_up";
}

/// State of a queued email job.
///
/// ```text
/// Pending -> Processing -> Sent
///    ^           |-------> Pending   (retry)
///    |           |-------> Failed    (dead-lettered)
///    |           '-------> Cancelled (demo mode)
///    '-- Processing (stuck claim released)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    /// Claimed by a processor tick and awaiting an outcome
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseError::JobStatus(other.to_string())),
        }
    }
}

/// Outcome recorded in the append-only email log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Sent,
    Failed,
    Cancelled,
}

impl LogStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseError::LogStatus(other.to_string())),
        }
    }
}

/// Kinds of analytics observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Sent,
    Opened,
    Clicked,
    Bounced,
    Unsubscribed,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Bounced => "bounced",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "opened" | "open" => Ok(Self::Opened),
            "clicked" | "click" => Ok(Self::Clicked),
            "bounced" | "bounce" => Ok(Self::Bounced),
            "unsubscribed" | "unsubscribe" => Ok(Self::Unsubscribed),
            other => Err(ParseError::EventType(other.to_string())),
        }
    }
}

/// Job priority; lower values are processed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Verification and test sends
    pub const URGENT: Self = Self(0);
    /// Welcome and re-consent mail
    pub const HIGH: Self = Self(1);
    /// Drip content and catch-up notices
    pub const NORMAL: Self = Self(5);
    pub const LOWEST: Self = Self(10);

    /// Build a priority, clamping into `0..=10`.
    #[must_use]
    pub fn new(value: i64) -> Self {
        Self(u8::try_from(value.clamp(0, 10)).unwrap_or(10))
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_clamps() {
        assert_eq!(Priority::new(-3), Priority::URGENT);
        assert_eq!(Priority::new(42), Priority::LOWEST);
        assert_eq!(Priority::new(5), Priority::NORMAL);
        assert!(Priority::URGENT < Priority::NORMAL);
    }

    #[test]
    fn test_event_type_accepts_short_forms() {
        assert_eq!("open".parse(), Ok(EventType::Opened));
        assert_eq!("clicked".parse(), Ok(EventType::Clicked));
        assert!("viewed".parse::<EventType>().is_err());
    }

    #[test]
    fn test_terminal_job_states() {
        assert!(JobStatus::Sent.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert_eq!("processing".parse(), Ok(JobStatus::Processing));
    }
}
