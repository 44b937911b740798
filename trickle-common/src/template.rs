//! `{{placeholder}}` substitution for subjects and bodies.
//!
//! Only a fixed set of names is recognised; anything else is left untouched
//! so a typo shows up in the delivered mail instead of silently vanishing.

use serde::{Deserialize, Serialize};

/// Placeholder names understood by [`render`].
pub const PLACEHOLDERS: [&str; 4] = ["subscriber_email", "title", "permalink", "unsubscribe_url"];

/// Values for the known placeholders. Unset values render as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars<'a> {
    pub subscriber_email: &'a str,
    pub title: &'a str,
    pub permalink: &'a str,
    pub unsubscribe_url: &'a str,
}

impl Vars<'_> {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "subscriber_email" => Some(self.subscriber_email),
            "title" => Some(self.title),
            "permalink" => Some(self.permalink),
            "unsubscribe_url" => Some(self.unsubscribe_url),
            _ => None,
        }
    }
}

/// A subject/body pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

impl Template {
    /// Render both halves.
    #[must_use]
    pub fn render(&self, vars: &Vars<'_>) -> (String, String) {
        (render(&self.subject, vars), render(&self.body, vars))
    }
}

/// Replace every `{{name}}` (whitespace inside the braces allowed) with its value.
#[must_use]
pub fn render(input: &str, vars: &Vars<'_>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let name = after[..end].trim();
        match vars.lookup(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}
