//! Strongly typed row identifiers.
//!
//! Every table keys its rows with a 64-bit integer. Wrapping them keeps a
//! subscriber id from being passed where a job id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }
    };
}

id_type!(
    /// Identifier of a subscriber, shared between the owning record and its mirror
    SubscriberId
);
id_type!(
    /// Identifier of a piece of drip content (a letter or newsletter)
    ContentId
);
id_type!(
    /// Identifier of a queued email job
    JobId
);
id_type!(
    /// Identifier of a dead-letter record
    DeadLetterId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_and_parse() {
        let id: JobId = " 42 ".parse().unwrap_or(JobId(0));
        assert_eq!(id, JobId(42));
        assert_eq!(id.to_string(), "42");
        assert!("forty-two".parse::<SubscriberId>().is_err());
    }

    #[test]
    fn test_ids_order_numerically() {
        let mut ids = vec![ContentId(102), ContentId(7), ContentId(55)];
        ids.sort();
        assert_eq!(ids, vec![ContentId(7), ContentId(55), ContentId(102)]);
    }
}
