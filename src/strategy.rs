//! Activation strategies.
//!
//! The documented built-in strategies are a closed set ([`BuiltinStrategy`]). Anything else is a
//! custom [`Strategy`] registered by name on the client configuration.
use std::{
    borrow::Cow,
    collections::BTreeMap,
    net::IpAddr,
};

use rand::{thread_rng, Rng};

use crate::{
    hasher::{ConsistentHasher, ROLLOUT_SEED},
    Context,
};

/// Strategy parameters as sent by the server.
pub type Parameters = BTreeMap<String, String>;

/// A custom activation strategy.
///
/// Implemented for closures, so a strategy can be registered inline:
///
/// ```
/// # use unleash_client::{Context, strategy::{Parameters, Strategy}};
/// let beta_testers = |parameters: &Parameters, context: &Context| {
///     context.properties.get("beta").map(String::as_str) == Some("true")
/// };
/// assert!(!beta_testers.is_enabled(&Parameters::new(), &Context::new()));
/// ```
pub trait Strategy: Send + Sync {
    fn is_enabled(&self, parameters: &Parameters, context: &Context) -> bool;
}

impl<F> Strategy for F
where
    F: Fn(&Parameters, &Context) -> bool + Send + Sync,
{
    fn is_enabled(&self, parameters: &Parameters, context: &Context) -> bool {
        self(parameters, context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum BuiltinStrategy {
    #[display(fmt = "default")]
    Default,
    #[display(fmt = "userWithId")]
    UserWithId,
    #[display(fmt = "gradualRolloutUserId")]
    GradualRolloutUserId,
    #[display(fmt = "gradualRolloutSessionId")]
    GradualRolloutSessionId,
    #[display(fmt = "gradualRolloutRandom")]
    GradualRolloutRandom,
    #[display(fmt = "flexibleRollout")]
    FlexibleRollout,
    #[display(fmt = "remoteAddress")]
    RemoteAddress,
    #[display(fmt = "applicationHostname")]
    ApplicationHostname,
}

/// Outcome of a built-in strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activation {
    Enabled,
    Disabled,
    /// A required parameter is missing or malformed.
    InvalidParameter(&'static str),
}

impl From<bool> for Activation {
    fn from(enabled: bool) -> Activation {
        if enabled {
            Activation::Enabled
        } else {
            Activation::Disabled
        }
    }
}

impl BuiltinStrategy {
    pub const ALL: [BuiltinStrategy; 8] = [
        BuiltinStrategy::Default,
        BuiltinStrategy::UserWithId,
        BuiltinStrategy::GradualRolloutUserId,
        BuiltinStrategy::GradualRolloutSessionId,
        BuiltinStrategy::GradualRolloutRandom,
        BuiltinStrategy::FlexibleRollout,
        BuiltinStrategy::RemoteAddress,
        BuiltinStrategy::ApplicationHostname,
    ];

    pub fn from_name(name: &str) -> Option<BuiltinStrategy> {
        BuiltinStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.to_string() == name)
    }

    /// Evaluate the strategy. `group_id` is the default hashing salt (the toggle name).
    pub(crate) fn activation(
        self,
        parameters: &Parameters,
        context: &Context,
        group_id: &str,
        hostname: &str,
        hasher: &impl ConsistentHasher,
    ) -> Activation {
        let group_id = parameters
            .get("groupId")
            .map(String::as_str)
            .unwrap_or(group_id);

        match self {
            BuiltinStrategy::Default => Activation::Enabled,

            BuiltinStrategy::UserWithId => {
                let Some(user_id) = context.user_id.as_deref() else {
                    return Activation::Disabled;
                };
                split_list(parameters.get("userIds"))
                    .any(|id| id == user_id)
                    .into()
            }

            BuiltinStrategy::GradualRolloutUserId | BuiltinStrategy::GradualRolloutSessionId => {
                let Some(percentage) = percentage(parameters, "percentage") else {
                    return Activation::InvalidParameter("percentage");
                };
                let key = if self == BuiltinStrategy::GradualRolloutUserId {
                    context.user_id.as_deref()
                } else {
                    context.session_id.as_deref()
                };
                match key {
                    Some(key) => in_rollout(key, group_id, percentage, hasher).into(),
                    None => Activation::Disabled,
                }
            }

            BuiltinStrategy::GradualRolloutRandom => {
                let Some(percentage) = percentage(parameters, "percentage") else {
                    return Activation::InvalidParameter("percentage");
                };
                let roll: u32 = thread_rng().gen_range(1..=100);
                (percentage > 0.0 && f64::from(roll) <= percentage).into()
            }

            BuiltinStrategy::FlexibleRollout => {
                let Some(percentage) = percentage(parameters, "rollout") else {
                    return Activation::InvalidParameter("rollout");
                };
                let stickiness = parameters
                    .get("stickiness")
                    .map(String::as_str)
                    .unwrap_or("default");
                let key = match stickiness {
                    "default" => context
                        .user_id
                        .as_deref()
                        .or(context.session_id.as_deref())
                        .map(Cow::Borrowed)
                        .unwrap_or_else(|| Cow::Owned(random_key())),
                    "random" => Cow::Owned(random_key()),
                    field => match context.get_field(field) {
                        Some(value) => value,
                        // A custom stickiness field that is absent means the subject can't be
                        // placed in the rollout.
                        None => return Activation::Disabled,
                    },
                };
                in_rollout(&key, group_id, percentage, hasher).into()
            }

            BuiltinStrategy::RemoteAddress => {
                let Some(remote_address) = context.remote_address.as_deref() else {
                    return Activation::Disabled;
                };
                split_list(parameters.get("IPs"))
                    .any(|range| ip_matches(remote_address, range))
                    .into()
            }

            BuiltinStrategy::ApplicationHostname => {
                let hostname = hostname.to_lowercase();
                split_list(parameters.get("hostNames"))
                    .any(|name| name.to_lowercase() == hostname)
                    .into()
            }
        }
    }
}

/// Comma-separated parameter values, trimmed, empty entries skipped.
fn split_list(parameter: Option<&String>) -> impl Iterator<Item = &str> {
    parameter
        .map(String::as_str)
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn percentage(parameters: &Parameters, name: &str) -> Option<f64> {
    parameters
        .get(name)?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite())
}

/// Buckets are `0..100`; a subject is in a `p`% rollout iff its 1-based bucket is `<= p`.
fn in_rollout(key: &str, group_id: &str, percentage: f64, hasher: &impl ConsistentHasher) -> bool {
    let bucket = hasher.bucket(key, group_id, 100, ROLLOUT_SEED);
    percentage > 0.0 && f64::from(bucket + 1) <= percentage
}

/// Stickiness fallback when the context carries no identifying field. This makes the outcome
/// non-deterministic: repeated evaluations of the same context can differ.
pub(crate) fn random_key() -> String {
    log::debug!(target: "unleash", "no stickiness field in context, falling back to a random key");
    thread_rng().gen_range(1..=100_000u32).to_string()
}

/// Match `address` against a single IP or a CIDR range.
fn ip_matches(address: &str, range: &str) -> bool {
    let Ok(address) = address.trim().parse::<IpAddr>() else {
        return address.trim() == range;
    };

    let Some((network, prefix)) = range.split_once('/') else {
        return range.parse::<IpAddr>().map_or(false, |ip| ip == address);
    };
    let (Ok(network), Ok(prefix)) = (network.trim().parse::<IpAddr>(), prefix.trim().parse::<u32>())
    else {
        return false;
    };

    match (address, network) {
        (IpAddr::V4(address), IpAddr::V4(network)) if prefix <= 32 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(address) & mask == u32::from(network) & mask
        }
        (IpAddr::V6(address), IpAddr::V6(network)) if prefix <= 128 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(address) & mask == u128::from(network) & mask
        }
        _ => false,
    }
}

/// Host name used by the `applicationHostname` strategy: `HOSTNAME` from the environment, then
/// the operating system's host name, then `"undefined"`.
pub(crate) fn default_hostname() -> String {
    resolve_hostname(
        std::env::var("HOSTNAME").ok(),
        gethostname::gethostname().into_string().ok(),
    )
}

fn resolve_hostname(env: Option<String>, os: Option<String>) -> String {
    env.filter(|h| !h.is_empty())
        .or_else(|| os.filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "undefined".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::Murmur3Hasher;

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn activation(strategy: BuiltinStrategy, parameters: &Parameters, context: &Context) -> Activation {
        strategy.activation(parameters, context, "toggle", "my-host", &Murmur3Hasher)
    }

    #[test]
    fn resolves_names() {
        for strategy in BuiltinStrategy::ALL {
            assert_eq!(BuiltinStrategy::from_name(&strategy.to_string()), Some(strategy));
        }
        assert_eq!(BuiltinStrategy::from_name("nope"), None);
    }

    #[test]
    fn user_with_id() {
        let parameters = params(&[("userIds", "1, 2 ,3")]);
        assert_eq!(
            activation(BuiltinStrategy::UserWithId, &parameters, &Context::new().with_user_id("2")),
            Activation::Enabled
        );
        assert_eq!(
            activation(BuiltinStrategy::UserWithId, &parameters, &Context::new().with_user_id("4")),
            Activation::Disabled
        );
        assert_eq!(
            activation(BuiltinStrategy::UserWithId, &parameters, &Context::new()),
            Activation::Disabled
        );
    }

    #[test]
    fn gradual_rollout_bounds() {
        let zero = params(&[("percentage", "0")]);
        let hundred = params(&[("percentage", "100")]);
        for i in 0..200 {
            let context = Context::new().with_user_id(format!("user-{i}"));
            assert_eq!(
                activation(BuiltinStrategy::GradualRolloutUserId, &zero, &context),
                Activation::Disabled
            );
            assert_eq!(
                activation(BuiltinStrategy::GradualRolloutUserId, &hundred, &context),
                Activation::Enabled
            );
        }
        // No user id: never enabled.
        assert_eq!(
            activation(BuiltinStrategy::GradualRolloutUserId, &hundred, &Context::new()),
            Activation::Disabled
        );
    }

    #[test]
    fn gradual_rollout_uses_group_id_parameter() {
        // normalize("123", "gr1") == 72: in at 73%, out at 72%.
        let context = Context::new().with_session_id("123");
        assert_eq!(
            activation(
                BuiltinStrategy::GradualRolloutSessionId,
                &params(&[("percentage", "73"), ("groupId", "gr1")]),
                &context
            ),
            Activation::Enabled
        );
        assert_eq!(
            activation(
                BuiltinStrategy::GradualRolloutSessionId,
                &params(&[("percentage", "72"), ("groupId", "gr1")]),
                &context
            ),
            Activation::Disabled
        );
    }

    #[test]
    fn flexible_rollout_stickiness() {
        let context = Context::new().with_property("tenant", "123");
        let parameters = params(&[("rollout", "73"), ("groupId", "gr1"), ("stickiness", "tenant")]);
        assert_eq!(
            activation(BuiltinStrategy::FlexibleRollout, &parameters, &context),
            Activation::Enabled
        );

        // Missing custom stickiness field
        assert_eq!(
            activation(BuiltinStrategy::FlexibleRollout, &parameters, &Context::new()),
            Activation::Disabled
        );

        // Default stickiness prefers userId over sessionId.
        let parameters = params(&[("rollout", "73"), ("groupId", "gr1")]);
        let context = Context::new().with_user_id("123").with_session_id("999");
        assert_eq!(
            activation(BuiltinStrategy::FlexibleRollout, &parameters, &context),
            Activation::Enabled
        );
    }

    #[test]
    fn flexible_rollout_random_stickiness_is_bounded() {
        // Random stickiness is non-deterministic, only the 0/100 bounds are stable.
        let context = Context::new();
        assert_eq!(
            activation(
                BuiltinStrategy::FlexibleRollout,
                &params(&[("rollout", "100"), ("stickiness", "random")]),
                &context
            ),
            Activation::Enabled
        );
        assert_eq!(
            activation(BuiltinStrategy::FlexibleRollout, &params(&[("rollout", "0")]), &context),
            Activation::Disabled
        );
    }

    #[test]
    fn malformed_percentage_is_reported() {
        assert_eq!(
            activation(
                BuiltinStrategy::FlexibleRollout,
                &params(&[("rollout", "lots")]),
                &Context::new().with_user_id("1")
            ),
            Activation::InvalidParameter("rollout")
        );
        assert_eq!(
            activation(BuiltinStrategy::GradualRolloutRandom, &Parameters::new(), &Context::new()),
            Activation::InvalidParameter("percentage")
        );
    }

    #[test]
    fn remote_address() {
        let parameters = params(&[("IPs", "10.0.0.1, 192.168.0.0/16, 2001:db8::/32")]);
        let enabled = |ip: &str| {
            activation(
                BuiltinStrategy::RemoteAddress,
                &parameters,
                &Context::new().with_remote_address(ip),
            )
        };

        assert_eq!(enabled("10.0.0.1"), Activation::Enabled);
        assert_eq!(enabled("10.0.0.2"), Activation::Disabled);
        assert_eq!(enabled("192.168.44.7"), Activation::Enabled);
        assert_eq!(enabled("192.169.0.1"), Activation::Disabled);
        assert_eq!(enabled("2001:db8::1"), Activation::Enabled);
        assert_eq!(enabled("2001:db9::1"), Activation::Disabled);
        assert_eq!(enabled("not an ip"), Activation::Disabled);
    }

    #[test]
    fn ip_matching_edge_cases() {
        assert!(ip_matches("1.2.3.4", "0.0.0.0/0"));
        assert!(ip_matches("1.2.3.4", "1.2.3.4/32"));
        assert!(!ip_matches("1.2.3.5", "1.2.3.4/32"));
        assert!(!ip_matches("1.2.3.4", "1.2.3.4/33"));
        assert!(!ip_matches("::1", "1.2.3.4/8"));
    }

    #[test]
    fn application_hostname() {
        assert_eq!(
            activation(
                BuiltinStrategy::ApplicationHostname,
                &params(&[("hostNames", "other,My-Host")]),
                &Context::new()
            ),
            Activation::Enabled
        );
        assert_eq!(
            activation(
                BuiltinStrategy::ApplicationHostname,
                &params(&[("hostNames", "other")]),
                &Context::new()
            ),
            Activation::Disabled
        );
    }

    #[test]
    fn hostname_prefers_environment_then_os() {
        let some = |s: &str| Some(s.to_owned());
        assert_eq!(resolve_hostname(some("env-host"), some("os-host")), "env-host");
        assert_eq!(resolve_hostname(some(""), some("os-host")), "os-host");
        assert_eq!(resolve_hostname(None, some("os-host")), "os-host");
        assert_eq!(resolve_hostname(None, some("")), "undefined");
        assert_eq!(resolve_hostname(None, None), "undefined");
    }

    #[test]
    fn hostname_falls_back_to_the_os() {
        let os = gethostname::gethostname().into_string().unwrap();
        if std::env::var("HOSTNAME").map_or(true, |h| h.is_empty()) && !os.is_empty() {
            assert_eq!(default_hostname(), os);
        }
        assert!(!default_hostname().is_empty());
    }

    #[test]
    fn closures_are_strategies() {
        let strategy = |parameters: &Parameters, _: &Context| parameters.contains_key("on");
        assert!(strategy.is_enabled(&params(&[("on", "")]), &Context::new()));
        assert!(!strategy.is_enabled(&Parameters::new(), &Context::new()));
    }
}
