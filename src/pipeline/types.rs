//! Shared types for the dispatch pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Inbound job ─────────────────────────────────────────────────────

/// One inbound routing request decoded from a broker message.
///
/// Every field is optional on the wire. An absent or empty field means
/// "no value", never an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Name of the payload (torrent name, file name, ...).
    #[serde(default)]
    pub name: String,
    /// Content hash reported by the producer.
    #[serde(default)]
    pub hash: String,
    /// Remote path to fetch.
    #[serde(default)]
    pub location: String,
    /// Producer-side category label.
    #[serde(default)]
    pub category: String,
}

impl Job {
    /// Decode a job from a raw JSON payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encode the job as a JSON payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ── Field lookup ────────────────────────────────────────────────────

/// Which job field a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobField {
    Name,
    Hash,
    Location,
    Category,
}

impl JobField {
    /// Parse a rule entity token, ignoring case. Unknown tokens yield `None`.
    pub fn parse(entity: &str) -> Option<Self> {
        const TABLE: [(&str, JobField); 4] = [
            ("name", JobField::Name),
            ("hash", JobField::Hash),
            ("location", JobField::Location),
            ("category", JobField::Category),
        ];

        TABLE
            .iter()
            .find(|(token, _)| token.eq_ignore_ascii_case(entity))
            .map(|(_, field)| *field)
    }

    /// Read this field from a job.
    pub fn value(self, job: &Job) -> &str {
        match self {
            Self::Name => &job.name,
            Self::Hash => &job.hash,
            Self::Location => &job.location,
            Self::Category => &job.category,
        }
    }
}

// ── Routing rules ───────────────────────────────────────────────────

/// Comparison applied by a routing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    /// `=` or `eq`
    Equals,
    /// `contains` or `in`: the rule value is a substring of the field.
    Contains,
    /// `!=` or `not`
    NotEquals,
    /// Anything else. Never matches.
    Unknown(String),
}

impl Operator {
    pub fn parse(token: &str) -> Self {
        match token {
            "=" | "eq" => Self::Equals,
            "contains" | "in" => Self::Contains,
            "!=" | "not" => Self::NotEquals,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Apply the comparison to a non-empty field value.
    pub fn matches(&self, field: &str, value: &str) -> bool {
        match self {
            Self::Equals => field == value,
            Self::Contains => field.contains(value),
            Self::NotEquals => field != value,
            Self::Unknown(_) => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals => f.write_str("eq"),
            Self::Contains => f.write_str("contains"),
            Self::NotEquals => f.write_str("not"),
            Self::Unknown(token) => write!(f, "unknown({token})"),
        }
    }
}

/// One entry of `server.codeConditions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Job field to inspect (case-insensitive).
    #[serde(default)]
    pub entity: String,
    /// Operator token as written in the config.
    #[serde(default)]
    pub operator: String,
    /// Comparison literal.
    #[serde(default)]
    pub value: String,
    /// Routing code produced on match.
    #[serde(default)]
    pub code: String,
}

impl RoutingRule {
    pub fn new(entity: &str, operator: &str, value: &str, code: &str) -> Self {
        Self {
            entity: entity.into(),
            operator: operator.into(),
            value: value.into(),
            code: code.into(),
        }
    }
}

/// Default code plus the ordered rule list. Order is the tie-break.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_code: String,
    #[serde(default)]
    pub code_conditions: Vec<RoutingRule>,
}
