use std::{borrow::Cow, collections::HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Evaluation context supplied with every `is_enabled`/`get_variant` call.
///
/// Well-known fields are addressed by their wire names (`userId`, `sessionId`, `remoteAddress`,
/// `environment`, `appName`, `currentTime`). Any other field name is looked up in
/// [`Context::properties`].
///
/// ```
/// # use unleash_client::Context;
/// let context = Context::new()
///     .with_user_id("user-1")
///     .with_property("tenant", "acme");
/// assert_eq!(context.get_field("userId").as_deref(), Some("user-1"));
/// assert_eq!(context.get_field("tenant").as_deref(), Some("acme"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Context {
        Context::default()
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Context {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Context {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_remote_address(mut self, remote_address: impl Into<String>) -> Context {
        self.remote_address = Some(remote_address.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Context {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Context {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn with_current_time(mut self, current_time: DateTime<Utc>) -> Context {
        self.current_time = Some(current_time);
        self
    }

    /// Add a custom property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Context {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Resolve a context field by its wire name.
    ///
    /// Returns `None` when the field is not set. `currentTime` is only returned when it was set
    /// explicitly; date operators fall back to "now" themselves.
    pub fn get_field(&self, name: &str) -> Option<Cow<'_, str>> {
        let value = match name {
            "userId" => self.user_id.as_deref(),
            "sessionId" => self.session_id.as_deref(),
            "remoteAddress" => self.remote_address.as_deref(),
            "environment" => self.environment.as_deref(),
            "appName" => self.app_name.as_deref(),
            "currentTime" => {
                return self
                    .current_time
                    .map(|t| Cow::Owned(t.to_rfc3339()));
            }
            _ => self.properties.get(name).map(String::as_str),
        };
        value.map(Cow::Borrowed)
    }

    /// Fill `appName` and `environment` from static client configuration unless the caller set
    /// them already.
    pub(crate) fn with_static_fields(&self, app_name: &str, environment: &str) -> Context {
        let mut context = self.clone();
        context.app_name.get_or_insert_with(|| app_name.to_owned());
        context
            .environment
            .get_or_insert_with(|| environment.to_owned());
        context
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::Context;

    #[test]
    fn resolves_well_known_fields_and_properties() {
        let context = Context::new()
            .with_user_id("u")
            .with_session_id("s")
            .with_remote_address("10.0.0.1")
            .with_property("region", "eu");

        assert_eq!(context.get_field("userId").as_deref(), Some("u"));
        assert_eq!(context.get_field("sessionId").as_deref(), Some("s"));
        assert_eq!(context.get_field("remoteAddress").as_deref(), Some("10.0.0.1"));
        assert_eq!(context.get_field("region").as_deref(), Some("eu"));
        assert_eq!(context.get_field("environment"), None);
        assert_eq!(context.get_field("missing"), None);
    }

    #[test]
    fn formats_current_time() {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let context = Context::new().with_current_time(time);
        assert_eq!(
            context.get_field("currentTime").as_deref(),
            Some("2024-01-02T03:04:05+00:00")
        );
    }

    #[test]
    fn static_fields_do_not_override_caller() {
        let context = Context::new().with_environment("staging");
        let merged = context.with_static_fields("my-app", "production");
        assert_eq!(merged.app_name.as_deref(), Some("my-app"));
        assert_eq!(merged.environment.as_deref(), Some("staging"));
    }
}
