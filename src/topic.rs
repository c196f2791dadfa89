//! Wire topic grammar
//!
//! ```text
//! [<controlPrefix><sep>]<account><sep><deviceId><sep><applicationId>[<sep><subtopic>]
//! ```
//!
//! Applications only ever see their logical (application-relative) topic; the
//! codec adds and strips the account/device/application namespace.

use crate::config::TopicOptions;

/// A wire topic split into its namespace parts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationTopic {
    pub control_prefix: Option<String>,
    pub account_token: String,
    pub device_id: String,
    pub application_id: String,
    pub subtopic: Option<String>,
}

impl ApplicationTopic {
    pub fn is_control(&self) -> bool {
        self.control_prefix.is_some()
    }

    /// The topic relative to the application, empty when absent
    pub fn application_topic(&self) -> &str {
        self.subtopic.as_deref().unwrap_or("")
    }

    /// `<applicationId>/<subtopic>` as seen from the connector
    pub fn full_application_topic(&self, separator: &str) -> String {
        match &self.subtopic {
            Some(subtopic) => format!("{}{}{}", self.application_id, separator, subtopic),
            None => self.application_id.clone(),
        }
    }
}

/// Encodes and decodes wire topics for one account
#[derive(Debug, Clone)]
pub struct TopicCodec {
    control_prefix: String,
    account: String,
    separator: String,
    wildcard: String,
}

impl TopicCodec {
    pub fn new(
        control_prefix: impl Into<String>,
        account: impl Into<String>,
        separator: impl Into<String>,
    ) -> Self {
        Self {
            control_prefix: control_prefix.into(),
            account: account.into(),
            separator: separator.into(),
            wildcard: "#".to_string(),
        }
    }

    pub fn from_options(options: &TopicOptions) -> Self {
        Self {
            control_prefix: options.control_prefix.clone(),
            account: options.account_name.clone(),
            separator: options.separator.clone(),
            wildcard: options.wildcard.clone(),
        }
    }

    pub fn control_prefix(&self) -> &str {
        &self.control_prefix
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn encode(
        &self,
        application_id: &str,
        device_id: &str,
        subtopic: &str,
        is_control: bool,
    ) -> String {
        let sep = &self.separator;
        let mut topic = String::with_capacity(
            self.control_prefix.len()
                + self.account.len()
                + device_id.len()
                + application_id.len()
                + subtopic.len()
                + 4 * sep.len(),
        );
        if is_control {
            topic.push_str(&self.control_prefix);
            topic.push_str(sep);
        }
        topic.push_str(&self.account);
        topic.push_str(sep);
        topic.push_str(device_id);
        topic.push_str(sep);
        topic.push_str(application_id);
        if !subtopic.is_empty() {
            topic.push_str(sep);
            topic.push_str(subtopic);
        }
        topic
    }

    /// Splits a wire topic into its parts.
    ///
    /// The account segment is taken as-is, never compared against the
    /// configured account. The subtopic is the untouched remainder of `wire`,
    /// so separators inside it survive.
    pub fn decode(&self, wire: &str, control_prefix_hint: &str) -> ApplicationTopic {
        if wire == self.wildcard {
            return ApplicationTopic::default();
        }

        let sep = self.separator.as_str();
        let mut rest = wire;
        let mut topic = ApplicationTopic::default();

        let starts_with_prefix = !control_prefix_hint.is_empty()
            && first_segment(rest, sep).starts_with(control_prefix_hint);
        if starts_with_prefix {
            topic.control_prefix = take_segment(&mut rest, sep).map(str::to_string);
        }

        topic.account_token = take_segment(&mut rest, sep).unwrap_or_default().to_string();
        topic.device_id = take_segment(&mut rest, sep).unwrap_or_default().to_string();
        topic.application_id = take_segment(&mut rest, sep).unwrap_or_default().to_string();
        if !rest.is_empty() {
            topic.subtopic = Some(rest.to_string());
        }
        topic
    }

    /// Decodes using the configured control prefix as hint
    pub fn decode_wire(&self, wire: &str) -> ApplicationTopic {
        self.decode(wire, &self.control_prefix)
    }

    /// `<prefix>/<account>/<client>/#`
    pub fn default_subscription(&self, client_id: &str) -> String {
        let sep = &self.separator;
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.control_prefix, self.account, client_id, self.wildcard
        )
    }

    /// `<prefix>/<account>/<client>/<suffix>`
    pub fn lifecycle_topic(&self, client_id: &str, suffix: &str) -> String {
        let sep = &self.separator;
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.control_prefix, self.account, client_id, suffix
        )
    }

    /// MQTT filter matching with `+` and `#` wildcards.
    ///
    /// Topics whose first level starts with `$` only match filters that name
    /// that level explicitly.
    pub fn topic_matches(&self, filter: &str, topic: &str) -> bool {
        let sep = self.separator.as_str();
        if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
            return false;
        }

        let mut filter_levels = filter.split(sep);
        let mut topic_levels = topic.split(sep);
        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(f), Some(t)) if f == t => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

fn first_segment<'a>(rest: &'a str, sep: &str) -> &'a str {
    match rest.find(sep) {
        Some(idx) => &rest[..idx],
        None => rest,
    }
}

fn take_segment<'a>(rest: &mut &'a str, sep: &str) -> Option<&'a str> {
    if rest.is_empty() {
        return None;
    }
    match rest.find(sep) {
        Some(idx) => {
            let segment = &rest[..idx];
            *rest = &rest[idx + sep.len()..];
            Some(segment)
        }
        None => {
            let segment = *rest;
            *rest = "";
            Some(segment)
        }
    }
}
