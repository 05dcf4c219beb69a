use std::borrow::Cow;

use chrono::{DateTime, Utc};
use semver::Version;

use crate::{
    engine::Diagnostic,
    toggles::{Constraint, Operator},
    Context,
};

/// Return `true` if all constraints hold for `context`. An empty list always holds.
pub(crate) fn all_hold(
    constraints: &[Constraint],
    context: &Context,
    diagnostics: &mut Vec<Diagnostic>,
) -> bool {
    constraints
        .iter()
        .all(|constraint| constraint.eval(context, diagnostics))
}

impl Constraint {
    /// Apply the constraint to `context`. Returns `false` if the context lacks the field, the
    /// values cannot be parsed, or the operator is unknown.
    pub(crate) fn eval(&self, context: &Context, diagnostics: &mut Vec<Diagnostic>) -> bool {
        if let Operator::Unknown(operator) = &self.operator {
            diagnostics.push(Diagnostic::UnknownOperator {
                operator: operator.clone(),
                context_name: self.context_name.clone(),
            });
            return false;
        }

        let field = match context.get_field(&self.context_name) {
            Some(field) => field,
            // Date operators compare against "now" when no time was supplied.
            None if self.context_name == "currentTime" => Cow::Owned(Utc::now().to_rfc3339()),
            None => return false,
        };

        match self.try_eval(&field) {
            Some(result) => result != self.inverted,
            None => false,
        }
    }

    /// Try applying the operator, returning `None` if it cannot be applied to these values.
    fn try_eval(&self, field: &str) -> Option<bool> {
        match self.operator {
            Operator::In | Operator::NotIn => {
                let is_in = self.values.iter().any(|v| v == field);
                Some(is_in == (self.operator == Operator::In))
            }

            Operator::StrContains | Operator::StrStartsWith | Operator::StrEndsWith => {
                let normalize = |s: &str| -> String {
                    if self.case_insensitive {
                        s.to_lowercase()
                    } else {
                        s.to_owned()
                    }
                };
                let field = normalize(field);
                Some(self.values.iter().map(|v| normalize(v)).any(|v| {
                    match self.operator {
                        Operator::StrContains => field.contains(&v),
                        Operator::StrStartsWith => field.starts_with(&v),
                        _ => field.ends_with(&v),
                    }
                }))
            }

            Operator::NumEq
            | Operator::NumGt
            | Operator::NumGte
            | Operator::NumLt
            | Operator::NumLte => {
                let field: f64 = field.trim().parse().ok()?;
                let value: f64 = self.single_value()?.trim().parse().ok()?;
                Some(match self.operator {
                    Operator::NumEq => field == value,
                    Operator::NumGt => field > value,
                    Operator::NumGte => field >= value,
                    Operator::NumLt => field < value,
                    _ => field <= value,
                })
            }

            Operator::DateAfter | Operator::DateBefore => {
                let field = parse_date(field)?;
                let value = parse_date(self.single_value()?)?;
                Some(if self.operator == Operator::DateAfter {
                    field > value
                } else {
                    field < value
                })
            }

            Operator::SemverEq | Operator::SemverGt | Operator::SemverLt => {
                let field = Version::parse(field.trim()).ok()?;
                let value = Version::parse(self.single_value()?.trim()).ok()?;
                Some(match self.operator {
                    Operator::SemverEq => field == value,
                    Operator::SemverGt => field > value,
                    _ => field < value,
                })
            }

            Operator::Unknown(_) => None,
        }
    }

    /// Single-value operators read `value`, falling back to the first of `values`.
    fn single_value(&self) -> Option<&str> {
        self.value
            .as_deref()
            .or_else(|| self.values.first().map(String::as_str))
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
