//! Subject and body templates for every mail the scheduler enqueues.
//!
//! Each template may use the `{{subscriber_email}}`, `{{title}}`,
//! `{{permalink}}` and `{{unsubscribe_url}}` placeholders.

use serde::Deserialize;
use trickle_common::{Priority, job::templates, template::Template};

mod defaults {
    use trickle_common::template::Template;

    fn template(subject: &str, body: &str) -> Template {
        Template {
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }

    pub fn letter() -> Template {
        template(
            "{{title}}",
            "<p><a href=\"{{permalink}}\">Read this letter online</a></p>\n\
             <p><a href=\"{{unsubscribe_url}}\">Unsubscribe</a></p>",
        )
    }

    pub fn caught_up() -> Template {
        template(
            "You're all caught up",
            "<p>You have received every letter published so far. \
             New letters will arrive as they are written.</p>\n\
             <p><a href=\"{{unsubscribe_url}}\">Unsubscribe</a></p>",
        )
    }

    pub fn verification() -> Template {
        template(
            "Please confirm your subscription",
            "<p>Confirm that {{subscriber_email}} should receive our letters.</p>",
        )
    }

    pub fn welcome() -> Template {
        template(
            "Welcome aboard",
            "<p>Thanks for subscribing. Your first letter is on its way.</p>\n\
             <p><a href=\"{{unsubscribe_url}}\">Unsubscribe</a></p>",
        )
    }

    pub fn reconsent() -> Template {
        template(
            "Do you still want our letters?",
            "<p>Please confirm you would like to keep receiving letters at \
             {{subscriber_email}}.</p>\n<p><a href=\"{{unsubscribe_url}}\">Unsubscribe</a></p>",
        )
    }

    pub fn test() -> Template {
        template(
            "Test email",
            "<p>This is a test email sent to {{subscriber_email}}.</p>",
        )
    }

    pub fn unsubscribe_url_base() -> String {
        "https://localhost/unsubscribe".to_string()
    }
}

/// Mail sent outside the drip rotation, triggered by a subscriber action or
/// an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Verification,
    Welcome,
    Reconsent,
    Test,
}

impl Notice {
    #[must_use]
    pub const fn template_name(self) -> &'static str {
        match self {
            Self::Verification => templates::VERIFICATION,
            Self::Welcome => templates::WELCOME,
            Self::Reconsent => templates::RECONSENT,
            Self::Test => templates::TEST,
        }
    }

    #[must_use]
    pub const fn priority(self) -> Priority {
        match self {
            Self::Verification | Self::Test => Priority::URGENT,
            Self::Welcome | Self::Reconsent => Priority::HIGH,
        }
    }
}

/// # Example
///
/// ```ron
/// templates: (
///     unsubscribe_url_base: "https://example.com/unsubscribe",
///     caught_up: (
///         subject: "Nothing new, {{subscriber_email}}",
///         body: "<p>See you soon.</p>",
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DripTemplates {
    /// Unsubscribe links are `{base}?subscriber={id}`
    #[serde(default = "defaults::unsubscribe_url_base")]
    pub unsubscribe_url_base: String,

    /// Appended after the content body of every drip letter
    #[serde(default = "defaults::letter")]
    pub letter: Template,

    #[serde(default = "defaults::caught_up")]
    pub caught_up: Template,

    #[serde(default = "defaults::verification")]
    pub verification: Template,

    #[serde(default = "defaults::welcome")]
    pub welcome: Template,

    #[serde(default = "defaults::reconsent")]
    pub reconsent: Template,

    #[serde(default = "defaults::test")]
    pub test: Template,
}

impl Default for DripTemplates {
    fn default() -> Self {
        Self {
            unsubscribe_url_base: defaults::unsubscribe_url_base(),
            letter: defaults::letter(),
            caught_up: defaults::caught_up(),
            verification: defaults::verification(),
            welcome: defaults::welcome(),
            reconsent: defaults::reconsent(),
            test: defaults::test(),
        }
    }
}

impl DripTemplates {
    #[must_use]
    pub fn notice(&self, notice: Notice) -> &Template {
        match notice {
            Notice::Verification => &self.verification,
            Notice::Welcome => &self.welcome,
            Notice::Reconsent => &self.reconsent,
            Notice::Test => &self.test,
        }
    }

    #[must_use]
    pub fn unsubscribe_url(&self, subscriber: trickle_common::SubscriberId) -> String {
        format!(
            "{}?subscriber={subscriber}",
            self.unsubscribe_url_base.trim_end_matches('?')
        )
    }
}

#[cfg(test)]
mod tests {
    use trickle_common::SubscriberId;

    use super::*;

    #[test]
    fn test_partial_templates_keep_defaults() {
        let templates: DripTemplates = ron::from_str(
            r#"(unsubscribe_url_base: "https://example.com/u", test: (subject: "Ping", body: "Pong"))"#,
        )
        .expect("Failed to parse templates");

        assert_eq!(templates.test.subject, "Ping");
        assert_eq!(templates.caught_up.subject, "You're all caught up");
        assert_eq!(
            templates.unsubscribe_url(SubscriberId(9)),
            "https://example.com/u?subscriber=9"
        );
    }

    #[test]
    fn test_notice_priorities() {
        assert_eq!(Notice::Verification.priority(), Priority::URGENT);
        assert_eq!(Notice::Welcome.priority(), Priority::HIGH);
        assert_eq!(Notice::Reconsent.template_name(), "reconsent");
    }
}
