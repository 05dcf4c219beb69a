//! Strategy evaluation.
//!
//! Evaluation is a pure function of a [`ToggleDefinition`] and a [`Context`]: it never performs
//! I/O, never mutates its inputs, and never fails. Misconfiguration (unknown strategies, unknown
//! operators, malformed parameters) makes the affected strategy non-matching and is reported as
//! [`Diagnostic`]s on the returned [`Evaluation`].
use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    constraints,
    hasher::{ConsistentHasher, Murmur3Hasher, VARIANT_SEED},
    strategy::{self, Activation, BuiltinStrategy, Strategy},
    toggles::{StrategyConfig, ToggleDefinition, Variant, VariantDefinition},
    Context,
};

/// Result of evaluating a toggle against a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub enabled: bool,
    /// Selected variant. Always `None` when the toggle is disabled or has no variants with
    /// non-zero weight.
    pub variant: Option<Variant>,
    /// Problems encountered while evaluating. Empty for well-formed toggles.
    pub diagnostics: Vec<Diagnostic>,
}

impl Evaluation {
    fn disabled(diagnostics: Vec<Diagnostic>) -> Evaluation {
        Evaluation {
            enabled: false,
            variant: None,
            diagnostics,
        }
    }
}

/// A non-fatal evaluation problem. The strategy or constraint it refers to was treated as not
/// matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    UnknownStrategy {
        strategy: String,
    },
    UnknownOperator {
        operator: String,
        context_name: String,
    },
    InvalidParameter {
        strategy: String,
        parameter: &'static str,
    },
    /// Variant weights add up to more than `u32::MAX`; no variant was selected.
    VariantWeightOverflow {
        group_id: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnknownStrategy { strategy } => {
                write!(f, "unknown strategy \"{strategy}\"")
            }
            Diagnostic::UnknownOperator {
                operator,
                context_name,
            } => write!(
                f,
                "unknown constraint operator \"{operator}\" on context field \"{context_name}\""
            ),
            Diagnostic::InvalidParameter {
                strategy,
                parameter,
            } => write!(
                f,
                "missing or invalid parameter \"{parameter}\" for strategy \"{strategy}\""
            ),
            Diagnostic::VariantWeightOverflow { group_id } => {
                write!(f, "variant weights in group \"{group_id}\" overflow")
            }
        }
    }
}

/// Evaluates toggles with the built-in strategies plus any registered custom strategies.
#[derive(Clone)]
pub struct StrategyEngine {
    custom: HashMap<String, Arc<dyn Strategy>>,
    hostname: String,
}

impl Default for StrategyEngine {
    fn default() -> StrategyEngine {
        StrategyEngine::new()
    }
}

impl fmt::Debug for StrategyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyEngine")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .field("hostname", &self.hostname)
            .finish()
    }
}

impl StrategyEngine {
    /// Engine with only the built-in strategies, using `HOSTNAME` for `applicationHostname`.
    pub fn new() -> StrategyEngine {
        StrategyEngine {
            custom: HashMap::new(),
            hostname: strategy::default_hostname(),
        }
    }

    /// Register a custom strategy. Custom strategies take precedence over built-ins with the same
    /// name.
    pub fn with_strategy(mut self, name: impl Into<String>, strategy: Arc<dyn Strategy>) -> Self {
        self.custom.insert(name.into(), strategy);
        self
    }

    /// Override the host name used by the `applicationHostname` strategy.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Names of all strategies this engine can evaluate.
    pub fn strategy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = BuiltinStrategy::ALL.iter().map(|s| s.to_string()).collect();
        names.extend(self.custom.keys().cloned());
        names.sort();
        names.dedup();
        names
    }

    pub fn evaluate(&self, toggle: &ToggleDefinition, context: &Context) -> Evaluation {
        self.evaluate_with_hasher(toggle, context, &Murmur3Hasher)
    }

    pub fn evaluate_with_hasher(
        &self,
        toggle: &ToggleDefinition,
        context: &Context,
        hasher: &impl ConsistentHasher,
    ) -> Evaluation {
        let mut diagnostics = Vec::new();

        if !toggle.enabled {
            return Evaluation::disabled(diagnostics);
        }

        if !constraints::all_hold(&toggle.constraints, context, &mut diagnostics) {
            return Evaluation::disabled(diagnostics);
        }

        // No strategies at all means "on for everyone".
        let variants = if toggle.strategies.is_empty() {
            (&toggle.variants, toggle.name.as_str())
        } else {
            let Some(strategy) = toggle.strategies.iter().find(|strategy| {
                constraints::all_hold(&strategy.constraints, context, &mut diagnostics)
                    && self.strategy_matches(toggle, strategy, context, hasher, &mut diagnostics)
            }) else {
                return Evaluation::disabled(diagnostics);
            };

            if strategy.variants.is_empty() {
                (&toggle.variants, toggle.name.as_str())
            } else {
                let group_id = strategy
                    .parameters
                    .get("groupId")
                    .map(String::as_str)
                    .unwrap_or(&toggle.name);
                (&strategy.variants, group_id)
            }
        };

        let variant = match select_variant(variants.0, variants.1, context, hasher) {
            Ok(variant) => variant.map(Variant::from),
            Err(overflow) => {
                diagnostics.push(overflow);
                None
            }
        };

        Evaluation {
            enabled: true,
            variant,
            diagnostics,
        }
    }

    fn strategy_matches(
        &self,
        toggle: &ToggleDefinition,
        strategy: &StrategyConfig,
        context: &Context,
        hasher: &impl ConsistentHasher,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> bool {
        if let Some(custom) = self.custom.get(&strategy.name) {
            return custom.is_enabled(&strategy.parameters, context);
        }

        let Some(builtin) = BuiltinStrategy::from_name(&strategy.name) else {
            diagnostics.push(Diagnostic::UnknownStrategy {
                strategy: strategy.name.clone(),
            });
            return false;
        };

        match builtin.activation(
            &strategy.parameters,
            context,
            &toggle.name,
            &self.hostname,
            hasher,
        ) {
            Activation::Enabled => true,
            Activation::Disabled => false,
            Activation::InvalidParameter(parameter) => {
                diagnostics.push(Diagnostic::InvalidParameter {
                    strategy: strategy.name.clone(),
                    parameter,
                });
                false
            }
        }
    }
}

/// Pick a variant: overrides first, then weighted selection over the stickiness key.
///
/// Returns `Ok(None)` if there are no variants or their total weight is zero, and a
/// [`Diagnostic::VariantWeightOverflow`] if the total weight doesn't fit the bucket range.
pub(crate) fn select_variant<'a>(
    variants: &'a [VariantDefinition],
    group_id: &str,
    context: &Context,
    hasher: &impl ConsistentHasher,
) -> std::result::Result<Option<&'a VariantDefinition>, Diagnostic> {
    let total_weight = variants
        .iter()
        .try_fold(0u32, |total, v| total.checked_add(v.weight))
        .ok_or_else(|| Diagnostic::VariantWeightOverflow {
            group_id: group_id.to_owned(),
        })?;
    if total_weight == 0 {
        return Ok(None);
    }

    let overridden = variants.iter().find(|variant| {
        variant.overrides.iter().any(|over| {
            context
                .get_field(&over.context_name)
                .is_some_and(|value| over.values.iter().any(|v| *v == *value))
        })
    });
    if overridden.is_some() {
        return Ok(overridden);
    }

    let stickiness = variants
        .first()
        .and_then(|v| v.stickiness.as_deref())
        .unwrap_or("default");
    let key = stickiness_key(context, stickiness).unwrap_or_else(strategy::random_key);

    let target = hasher.bucket(&key, group_id, total_weight, VARIANT_SEED);

    // Partial sums never exceed `total_weight`, which was checked above.
    let mut upper = 0u32;
    Ok(variants.iter().find(|variant| {
        upper += variant.weight;
        target < upper
    }))
}

/// Resolve the hashing key for variant selection. `None` means the context has no usable field.
fn stickiness_key(context: &Context, stickiness: &str) -> Option<String> {
    match stickiness {
        "default" => context
            .user_id
            .clone()
            .or_else(|| context.session_id.clone())
            .or_else(|| context.remote_address.clone()),
        "random" => None,
        field => context.get_field(field).map(|v| v.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::toggles::{Constraint, Operator, Override, Payload};

    /// Hasher that always returns the same bucket.
    struct FixedHasher(u32);

    impl ConsistentHasher for FixedHasher {
        fn bucket(&self, _identifier: &str, _group_id: &str, buckets: u32, _seed: u32) -> u32 {
            self.0 % buckets
        }
    }

    fn rollout(percentage: &str) -> StrategyConfig {
        StrategyConfig::new("gradualRolloutUserId").with_parameter("percentage", percentage)
    }

    #[test]
    fn disabled_toggle_ignores_everything() {
        let toggle = ToggleDefinition::new("t", false)
            .with_strategy(StrategyConfig::new("default"))
            .with_variant(VariantDefinition::new("a", 1));

        for context in [Context::new(), Context::new().with_user_id("1")] {
            let evaluation = StrategyEngine::new().evaluate(&toggle, &context);
            assert!(!evaluation.enabled);
            assert_eq!(evaluation.variant, None);
        }
    }

    #[test]
    fn no_strategies_means_enabled() {
        let toggle = ToggleDefinition::new("t", true);
        let evaluation = StrategyEngine::new().evaluate(&toggle, &Context::new());
        assert!(evaluation.enabled);
        assert_eq!(evaluation.variant, None);
        assert!(evaluation.diagnostics.is_empty());
    }

    #[test]
    fn first_matching_strategy_wins() {
        let toggle = ToggleDefinition::new("t", true)
            .with_strategy(StrategyConfig::new("userWithId").with_parameter("userIds", "7"))
            .with_strategy(rollout("100"));

        let engine = StrategyEngine::new();
        assert!(engine.evaluate(&toggle, &Context::new().with_user_id("1")).enabled);
        assert!(!engine.evaluate(&toggle, &Context::new()).enabled);
    }

    #[test]
    fn strategy_constraints_scope_the_strategy() {
        let toggle = ToggleDefinition::new("t", true).with_strategy(
            StrategyConfig::new("default")
                .with_constraint(Constraint::new("environment", Operator::In, ["prod"])),
        );

        let engine = StrategyEngine::new();
        assert!(engine.evaluate(&toggle, &Context::new().with_environment("prod")).enabled);
        assert!(!engine.evaluate(&toggle, &Context::new().with_environment("dev")).enabled);
        assert!(!engine.evaluate(&toggle, &Context::new()).enabled);
    }

    #[test]
    fn toggle_constraints_apply_before_strategies() {
        let toggle = ToggleDefinition::new("t", true)
            .with_constraint(Constraint::new("appName", Operator::In, ["web"]));

        let engine = StrategyEngine::new();
        assert!(engine.evaluate(&toggle, &Context::new().with_app_name("web")).enabled);
        assert!(!engine.evaluate(&toggle, &Context::new().with_app_name("cli")).enabled);
    }

    #[test]
    fn unknown_strategy_falls_through() {
        let toggle = ToggleDefinition::new("t", true)
            .with_strategy(StrategyConfig::new("brandNewStrategy"))
            .with_strategy(StrategyConfig::new("default"));

        let evaluation = StrategyEngine::new().evaluate(&toggle, &Context::new());
        assert!(evaluation.enabled);
        assert_eq!(
            evaluation.diagnostics,
            vec![Diagnostic::UnknownStrategy {
                strategy: "brandNewStrategy".to_owned()
            }]
        );

        let toggle = ToggleDefinition::new("t", true)
            .with_strategy(StrategyConfig::new("brandNewStrategy"));
        let evaluation = StrategyEngine::new().evaluate(&toggle, &Context::new());
        assert!(!evaluation.enabled);
        assert_eq!(evaluation.diagnostics.len(), 1);
    }

    #[test]
    fn unknown_operator_degrades_to_disabled() {
        let toggle = ToggleDefinition::new("t", true).with_strategy(
            StrategyConfig::new("default").with_constraint(Constraint::new(
                "userId",
                Operator::Unknown("FUZZY".to_owned()),
                ["1"],
            )),
        );

        let evaluation = StrategyEngine::new().evaluate(&toggle, &Context::new().with_user_id("1"));
        assert!(!evaluation.enabled);
        assert!(matches!(
            evaluation.diagnostics.as_slice(),
            [Diagnostic::UnknownOperator { .. }]
        ));
    }

    #[test]
    fn custom_strategies_take_precedence() {
        let toggle = ToggleDefinition::new("t", true).with_strategy(StrategyConfig::new("default"));
        let engine = StrategyEngine::new().with_strategy(
            "default",
            Arc::new(|_: &strategy::Parameters, _: &Context| false),
        );
        assert!(!engine.evaluate(&toggle, &Context::new()).enabled);

        let toggle = ToggleDefinition::new("t", true).with_strategy(
            StrategyConfig::new("tenant").with_parameter("tenants", "acme"),
        );
        let engine = StrategyEngine::new().with_strategy(
            "tenant",
            Arc::new(|parameters: &strategy::Parameters, context: &Context| {
                context.properties.get("tenant") == parameters.get("tenants")
            }),
        );
        assert!(engine.evaluate(&toggle, &Context::new().with_property("tenant", "acme")).enabled);
        assert!(!engine.evaluate(&toggle, &Context::new()).enabled);
        assert!(engine.strategy_names().contains(&"tenant".to_owned()));
    }

    #[test]
    fn rollout_percentage_converges() {
        let toggle = ToggleDefinition::new("featureC", true).with_strategy(rollout("50"));
        let engine = StrategyEngine::new();

        let enabled = (0..10_000)
            .filter(|i| {
                engine
                    .evaluate(&toggle, &Context::new().with_user_id(format!("user-{i}")))
                    .enabled
            })
            .count();

        assert!(
            (4_700..=5_300).contains(&enabled),
            "{enabled} of 10000 enabled at 50%"
        );
    }

    #[test]
    fn weighted_variant_selection_uses_cumulative_ranges() {
        let toggle = ToggleDefinition::new("t", true)
            .with_variant(VariantDefinition::new("a", 1))
            .with_variant(VariantDefinition::new("b", 2))
            .with_variant(VariantDefinition::new("c", 1));
        let engine = StrategyEngine::new();
        let context = Context::new().with_user_id("1");

        let pick = |bucket| {
            engine
                .evaluate_with_hasher(&toggle, &context, &FixedHasher(bucket))
                .variant
                .map(|v| v.name)
        };

        assert_eq!(pick(0).as_deref(), Some("a"));
        assert_eq!(pick(1).as_deref(), Some("b"));
        assert_eq!(pick(2).as_deref(), Some("b"));
        assert_eq!(pick(3).as_deref(), Some("c"));
    }

    #[test]
    fn variant_selection_is_sticky() {
        let toggle = ToggleDefinition::new("featureD", true)
            .with_variant(VariantDefinition::new("a", 50))
            .with_variant(VariantDefinition::new("b", 50));
        let engine = StrategyEngine::new();
        let context = Context::new().with_user_id("user-1");

        let first = engine.evaluate(&toggle, &context).variant.unwrap();
        for _ in 0..100 {
            assert_eq!(engine.evaluate(&toggle, &context).variant.unwrap(), first);
        }
        assert!(first.enabled);
    }

    #[test]
    fn variants_spread_across_subjects() {
        let toggle = ToggleDefinition::new("featureD", true)
            .with_variant(VariantDefinition::new("a", 50))
            .with_variant(VariantDefinition::new("b", 50));
        let engine = StrategyEngine::new();

        let a = (0..1_000)
            .filter(|i| {
                engine
                    .evaluate(&toggle, &Context::new().with_user_id(i.to_string()))
                    .variant
                    .is_some_and(|v| v.name == "a")
            })
            .count();
        assert!((400..=600).contains(&a), "{a} of 1000 got variant a");
    }

    #[test]
    fn overrides_force_a_variant() {
        let toggle = ToggleDefinition::new("t", true)
            .with_variant(VariantDefinition::new("a", 100))
            .with_variant(
                VariantDefinition::new("b", 0)
                    .with_payload(Payload {
                        payload_type: "string".to_owned(),
                        value: "forced".to_owned(),
                    })
                    .with_override(Override {
                        context_name: "userId".to_owned(),
                        values: vec!["vip".to_owned()],
                    }),
            );
        let engine = StrategyEngine::new();

        let variant = engine
            .evaluate(&toggle, &Context::new().with_user_id("vip"))
            .variant
            .unwrap();
        assert_eq!(variant.name, "b");
        assert_eq!(variant.payload.unwrap().value, "forced");

        let variant = engine
            .evaluate(&toggle, &Context::new().with_user_id("regular"))
            .variant
            .unwrap();
        assert_eq!(variant.name, "a");
    }

    #[test]
    fn zero_total_weight_has_no_variant() {
        let toggle = ToggleDefinition::new("t", true).with_variant(VariantDefinition::new("a", 0));
        let evaluation = StrategyEngine::new().evaluate(&toggle, &Context::new().with_user_id("1"));
        assert!(evaluation.enabled);
        assert_eq!(evaluation.variant, None);
    }

    #[test]
    fn overflowing_variant_weights_select_nothing() {
        let toggle = ToggleDefinition::new("t", true)
            .with_variant(VariantDefinition::new("a", u32::MAX))
            .with_variant(VariantDefinition::new("b", 1));
        let evaluation = StrategyEngine::new().evaluate(&toggle, &Context::new().with_user_id("1"));
        assert!(evaluation.enabled);
        assert_eq!(evaluation.variant, None);
        assert_eq!(
            evaluation.diagnostics,
            vec![Diagnostic::VariantWeightOverflow {
                group_id: "t".to_owned()
            }]
        );
    }

    #[test]
    fn maximal_variant_weights_stay_selectable() {
        let toggle = ToggleDefinition::new("t", true)
            .with_variant(VariantDefinition::new("a", u32::MAX - 1))
            .with_variant(VariantDefinition::new("b", 1));
        let engine = StrategyEngine::new();
        let context = Context::new().with_user_id("1");

        let last = engine.evaluate_with_hasher(&toggle, &context, &FixedHasher(u32::MAX - 1));
        assert_eq!(last.variant.unwrap().name, "b");
        assert!(last.diagnostics.is_empty());

        let first = engine.evaluate_with_hasher(&toggle, &context, &FixedHasher(0));
        assert_eq!(first.variant.unwrap().name, "a");
    }

    #[test]
    fn strategy_variants_win_over_toggle_variants() {
        let toggle = ToggleDefinition::new("t", true)
            .with_strategy(
                StrategyConfig::new("default").with_variant(VariantDefinition::new("from-strategy", 1)),
            )
            .with_variant(VariantDefinition::new("from-toggle", 1));

        let evaluation = StrategyEngine::new().evaluate(&toggle, &Context::new().with_user_id("1"));
        assert_eq!(evaluation.variant.unwrap().name, "from-strategy");
    }

    #[test]
    fn custom_variant_stickiness() {
        let toggle = ToggleDefinition::new("t", true)
            .with_variant(VariantDefinition::new("a", 50).with_stickiness("tenant"))
            .with_variant(VariantDefinition::new("b", 50).with_stickiness("tenant"));
        let engine = StrategyEngine::new();

        let variant_for = |user: &str| {
            engine
                .evaluate(
                    &toggle,
                    &Context::new().with_user_id(user).with_property("tenant", "acme"),
                )
                .variant
                .unwrap()
        };
        // Same tenant, different users: same variant.
        let first = variant_for("1");
        for user in ["2", "3", "4", "5"] {
            assert_eq!(variant_for(user), first);
        }
    }

    #[test]
    fn evaluation_does_not_mutate_inputs() {
        let toggle = ToggleDefinition::new("t", true)
            .with_strategy(rollout("50"))
            .with_variant(VariantDefinition::new("a", 1));
        let context = Context::new().with_user_id("1");
        let (toggle_before, context_before) = (toggle.clone(), context.clone());

        let _ = StrategyEngine::new().evaluate(&toggle, &context);

        assert_eq!(toggle, toggle_before);
        assert_eq!(context, context_before);
    }
}
