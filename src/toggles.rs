//! Wire and persisted data model for toggle definitions.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use serde::{Deserialize, Deserializer, Serialize};

/// Response body of the `client/features` endpoint.
///
/// Unknown fields are ignored so that newer servers can add fields without breaking older
/// clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFeaturesResponse {
    #[serde(default = "default_version")]
    pub version: u32,
    pub features: Vec<ToggleDefinition>,
}

fn default_version() -> u32 {
    2
}

impl From<Vec<ToggleDefinition>> for ClientFeaturesResponse {
    fn from(features: Vec<ToggleDefinition>) -> Self {
        ClientFeaturesResponse {
            version: default_version(),
            features,
        }
    }
}

/// A named feature toggle. Immutable once received; replaced wholesale on every sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleDefinition {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub variants: Vec<VariantDefinition>,
    /// Constraints that must hold before any strategy is consulted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub toggle_type: Option<String>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub impression_data: bool,
}

impl ToggleDefinition {
    /// A toggle with no strategies, which is on whenever `enabled` is.
    pub fn new(name: impl Into<String>, enabled: bool) -> ToggleDefinition {
        ToggleDefinition {
            name: name.into(),
            enabled,
            strategies: Vec::new(),
            variants: Vec::new(),
            constraints: Vec::new(),
            description: None,
            project: None,
            toggle_type: None,
            stale: false,
            impression_data: false,
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> ToggleDefinition {
        self.strategies.push(strategy);
        self
    }

    pub fn with_variant(mut self, variant: VariantDefinition) -> ToggleDefinition {
        self.variants.push(variant);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> ToggleDefinition {
        self.constraints.push(constraint);
        self
    }
}

/// Activation strategy attached to a toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_parameters")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Strategy-level variants take precedence over the toggle's variants when this strategy
    /// matches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<VariantDefinition>,
}

impl StrategyConfig {
    pub fn new(name: impl Into<String>) -> StrategyConfig {
        StrategyConfig {
            name: name.into(),
            parameters: BTreeMap::new(),
            constraints: Vec::new(),
            variants: Vec::new(),
        }
    }

    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> StrategyConfig {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> StrategyConfig {
        self.constraints.push(constraint);
        self
    }

    pub fn with_variant(mut self, variant: VariantDefinition) -> StrategyConfig {
        self.variants.push(variant);
        self
    }
}

/// Some servers send numeric or boolean parameter values (e.g. `"rollout": 50`). Strategies
/// always see strings. Parameters are kept sorted so the persisted blob is stable.
fn deserialize_parameters<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => return None,
                other => other.to_string(),
            };
            Some((key, value))
        })
        .collect())
}

/// Scopes a strategy (or a whole toggle) to contexts whose field satisfies the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub context_name: String,
    pub operator: Operator,
    /// Values for the set operators (`IN`, `NOT_IN`, `STR_*`).
    #[serde(default)]
    pub values: Vec<String>,
    /// Value for the single-value operators (`NUM_*`, `DATE_*`, `SEMVER_*`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl Constraint {
    /// Constraint over a set of values.
    pub fn new<I, S>(context_name: impl Into<String>, operator: Operator, values: I) -> Constraint
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Constraint {
            context_name: context_name.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
            value: None,
            inverted: false,
            case_insensitive: false,
        }
    }

    /// Constraint over a single value.
    pub fn single(
        context_name: impl Into<String>,
        operator: Operator,
        value: impl Into<String>,
    ) -> Constraint {
        Constraint {
            context_name: context_name.into(),
            operator,
            values: Vec::new(),
            value: Some(value.into()),
            inverted: false,
            case_insensitive: false,
        }
    }

    pub fn inverted(mut self) -> Constraint {
        self.inverted = !self.inverted;
        self
    }

    pub fn case_insensitive(mut self) -> Constraint {
        self.case_insensitive = true;
        self
    }
}

/// Constraint operator. Operators this client doesn't know deserialize into
/// [`Operator::Unknown`] and never match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    In,
    NotIn,
    StrContains,
    StrStartsWith,
    StrEndsWith,
    NumEq,
    NumGt,
    NumGte,
    NumLt,
    NumLte,
    DateAfter,
    DateBefore,
    SemverEq,
    SemverGt,
    SemverLt,
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
            Operator::StrContains => "STR_CONTAINS",
            Operator::StrStartsWith => "STR_STARTS_WITH",
            Operator::StrEndsWith => "STR_ENDS_WITH",
            Operator::NumEq => "NUM_EQ",
            Operator::NumGt => "NUM_GT",
            Operator::NumGte => "NUM_GTE",
            Operator::NumLt => "NUM_LT",
            Operator::NumLte => "NUM_LTE",
            Operator::DateAfter => "DATE_AFTER",
            Operator::DateBefore => "DATE_BEFORE",
            Operator::SemverEq => "SEMVER_EQ",
            Operator::SemverGt => "SEMVER_GT",
            Operator::SemverLt => "SEMVER_LT",
            Operator::Unknown(name) => name,
        }
    }
}

impl From<String> for Operator {
    fn from(value: String) -> Operator {
        match value.as_str() {
            "IN" => Operator::In,
            "NOT_IN" => Operator::NotIn,
            "STR_CONTAINS" => Operator::StrContains,
            "STR_STARTS_WITH" => Operator::StrStartsWith,
            "STR_ENDS_WITH" => Operator::StrEndsWith,
            "NUM_EQ" => Operator::NumEq,
            "NUM_GT" => Operator::NumGt,
            "NUM_GTE" => Operator::NumGte,
            "NUM_LT" => Operator::NumLt,
            "NUM_LTE" => Operator::NumLte,
            "DATE_AFTER" => Operator::DateAfter,
            "DATE_BEFORE" => Operator::DateBefore,
            "SEMVER_EQ" => Operator::SemverEq,
            "SEMVER_GT" => Operator::SemverGt,
            "SEMVER_LT" => Operator::SemverLt,
            _ => Operator::Unknown(value),
        }
    }
}

impl From<Operator> for String {
    fn from(value: Operator) -> String {
        match value {
            Operator::Unknown(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variant as configured on a toggle or strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantDefinition {
    pub name: String,
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub overrides: Vec<Override>,
    /// Context field used to hash the subject. Only the first variant's stickiness is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stickiness: Option<String>,
}

impl VariantDefinition {
    pub fn new(name: impl Into<String>, weight: u32) -> VariantDefinition {
        VariantDefinition {
            name: name.into(),
            weight,
            payload: None,
            overrides: Vec::new(),
            stickiness: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> VariantDefinition {
        self.payload = Some(payload);
        self
    }

    pub fn with_override(mut self, over: Override) -> VariantDefinition {
        self.overrides.push(over);
        self
    }

    pub fn with_stickiness(mut self, stickiness: impl Into<String>) -> VariantDefinition {
        self.stickiness = Some(stickiness.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub value: String,
}

/// Forces a variant for contexts whose field has one of `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    pub context_name: String,
    pub values: Vec<String>,
}

/// The variant returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    pub enabled: bool,
}

impl Variant {
    pub const DISABLED_NAME: &'static str = "disabled";

    /// The variant returned when a toggle is disabled or has no variants.
    pub fn disabled() -> Variant {
        Variant {
            name: Variant::DISABLED_NAME.to_owned(),
            payload: None,
            enabled: false,
        }
    }
}

impl Default for Variant {
    fn default() -> Variant {
        Variant::disabled()
    }
}

impl From<&VariantDefinition> for Variant {
    fn from(definition: &VariantDefinition) -> Variant {
        Variant {
            name: definition.name.clone(),
            payload: definition.payload.clone(),
            enabled: true,
        }
    }
}

/// The full set of toggle definitions known to the repository, along with the server validation
/// token and a local revision counter.
///
/// A snapshot is immutable. It is also the persisted blob format: unknown fields are ignored when
/// loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SnapshotData", into = "SnapshotData")]
pub struct Snapshot {
    version: u32,
    features: Vec<ToggleDefinition>,
    etag: Option<String>,
    revision: u64,
    index: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotData {
    #[serde(default = "default_version")]
    version: u32,
    features: Vec<ToggleDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(default)]
    revision: u64,
}

impl From<SnapshotData> for Snapshot {
    fn from(data: SnapshotData) -> Snapshot {
        Snapshot::new(data.version, data.features, data.etag, data.revision)
    }
}

impl From<Snapshot> for SnapshotData {
    fn from(snapshot: Snapshot) -> SnapshotData {
        SnapshotData {
            version: snapshot.version,
            features: snapshot.features,
            etag: snapshot.etag,
            revision: snapshot.revision,
        }
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Snapshot) -> bool {
        // index is derived from features
        self.version == other.version
            && self.features == other.features
            && self.etag == other.etag
            && self.revision == other.revision
    }
}

impl Snapshot {
    /// Build a snapshot. Toggle names must be unique; later duplicates are dropped.
    pub fn new(
        version: u32,
        features: Vec<ToggleDefinition>,
        etag: Option<String>,
        revision: u64,
    ) -> Snapshot {
        let mut index = HashMap::with_capacity(features.len());
        let mut unique = Vec::with_capacity(features.len());
        for toggle in features {
            if index.contains_key(&toggle.name) {
                log::warn!(target: "unleash", toggle_name:display = toggle.name; "dropping duplicate toggle definition");
                continue;
            }
            index.insert(toggle.name.clone(), unique.len());
            unique.push(toggle);
        }

        Snapshot {
            version,
            features: unique,
            etag,
            revision,
            index,
        }
    }

    pub fn from_response(
        response: ClientFeaturesResponse,
        etag: Option<String>,
        revision: u64,
    ) -> Snapshot {
        Snapshot::new(response.version, response.features, etag, revision)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Server validation token of the response this snapshot was built from.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Local revision counter, incremented every time the repository replaces its snapshot.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, name: &str) -> Option<&ToggleDefinition> {
        self.index.get(name).map(|&i| &self.features[i])
    }

    /// Toggle definitions in the order the server sent them.
    pub fn toggles(&self) -> &[ToggleDefinition] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Same toggles with a different token and revision.
    pub(crate) fn restamp(&self, etag: Option<String>, revision: u64) -> Snapshot {
        Snapshot {
            etag,
            revision,
            ..self.clone()
        }
    }
}

/// Names of toggles whose definitions differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToggleDelta {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub modified: BTreeSet<String>,
}

impl ToggleDelta {
    /// Compare definitions by content. A missing `previous` snapshot means every toggle was added.
    pub fn between(previous: Option<&Snapshot>, current: &Snapshot) -> ToggleDelta {
        let mut delta = ToggleDelta::default();

        for toggle in current.toggles() {
            match previous.and_then(|p| p.get(&toggle.name)) {
                None => {
                    delta.added.insert(toggle.name.clone());
                }
                Some(old) if old != toggle => {
                    delta.modified.insert(toggle.name.clone());
                }
                Some(_) => {}
            }
        }

        if let Some(previous) = previous {
            delta.removed = previous
                .toggles()
                .iter()
                .filter(|t| current.get(&t.name).is_none())
                .map(|t| t.name.clone())
                .collect();
        }

        delta
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// All changed toggle names.
    pub fn names(&self) -> BTreeSet<&str> {
        self.added
            .iter()
            .chain(&self.removed)
            .chain(&self.modified)
            .map(String::as_str)
            .collect()
    }
}
