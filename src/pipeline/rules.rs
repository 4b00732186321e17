//! Routing rules engine.
//!
//! Maps a job to a routing code by walking `server.codeConditions` in order:
//! - the first rule whose predicate matches wins
//! - no match falls through to `server.defaultCode`
//!
//! A rule never matches when its field is missing or empty, whatever the
//! operator. That includes `not`: an empty name is not "different from" a
//! value as far as routing is concerned.

use tracing::{debug, warn};

use crate::pipeline::types::{Job, JobField, Operator, RoutingConfig, RoutingRule};

/// A routing rule with its entity and operator tokens resolved.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// `None` when the entity names no job field; such a rule never matches.
    pub field: Option<JobField>,
    pub operator: Operator,
    pub value: String,
    pub code: String,
}

impl CompiledRule {
    fn compile(rule: &RoutingRule) -> Self {
        let field = JobField::parse(&rule.entity);
        let operator = Operator::parse(&rule.operator);

        if field.is_none() {
            warn!(entity = %rule.entity, code = %rule.code, "Rule entity names no job field, rule will never match");
        }
        if let Operator::Unknown(ref token) = operator {
            warn!(operator = %token, code = %rule.code, "Unrecognised rule operator, rule will never match");
        }

        Self {
            field,
            operator,
            value: rule.value.clone(),
            code: rule.code.clone(),
        }
    }

    /// Evaluate this rule's predicate against a job.
    pub fn matches(&self, job: &Job) -> bool {
        let Some(field) = self.field else {
            return false;
        };
        let field_value = field.value(job);
        if field_value.is_empty() {
            return false;
        }
        self.operator.matches(field_value, &self.value)
    }
}

/// Ordered rule evaluator. Read-only once built.
#[derive(Debug, Clone)]
pub struct RulesEngine {
    rules: Vec<CompiledRule>,
    default_code: String,
}

impl RulesEngine {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            rules: config.code_conditions.iter().map(CompiledRule::compile).collect(),
            default_code: config.default_code.clone(),
        }
    }

    /// Create an engine with no rules (everything routes to `default_code`).
    pub fn empty(default_code: &str) -> Self {
        Self {
            rules: Vec::new(),
            default_code: default_code.into(),
        }
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Resolve the routing code for a job.
    pub fn evaluate(&self, job: &Job) -> &str {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.matches(job) {
                debug!(
                    name = %job.name,
                    rule = index,
                    operator = %rule.operator,
                    code = %rule.code,
                    "Job matched routing rule"
                );
                return &rule.code;
            }
        }

        debug!(name = %job.name, code = %self.default_code, "No routing rule matched, using default code");
        &self.default_code
    }
}
