//! Bounded concurrent evaluation
//!
//! One spawned task per payload, at most `max_concurrency` in flight. A task
//! yields `Result<AuditResult, DegradedReason>`; the engine turns every error
//! (including a panicked task) into a degraded result, so one transaction can
//! never affect its siblings. Unusable responses are degraded by the parser.

use futures::stream::{self, StreamExt};
use mta_common::config::FailurePolicy;
use std::sync::Arc;

use crate::models::{AuditResult, DegradedReason, RuleSet};
use crate::services::inference_client::{InferenceClient, InferenceRequest};
use crate::services::response_parser::{self, RESPONSE_SCHEMA_VERSION};
use crate::services::transaction_assembler::AuditPayload;

pub const DEFAULT_MAX_CONCURRENCY: usize = 50;

const AUDIT_INSTRUCTIONS: &str = "You audit material transfer transactions against compliance rules. \
The rules are a JSON array of objects: i = rule id, n = name, c = condition, t = thresholds, m = metrics. \
Check the transaction (and any attached images) against every rule. \
Reply with one JSON object and nothing else: {\"v\":VERSION,\"t\":<transaction id>,\"r\":[{\"i\":<rule id>,\"m\":\"<short reason>\"}]}. \
List only violated rules; reply with \"r\":[] when none are violated.";

/// Fans a page of payloads out to the inference service
#[derive(Clone)]
pub struct EvaluationEngine {
    client: Arc<dyn InferenceClient>,
    failure_policy: FailurePolicy,
}

impl EvaluationEngine {
    pub fn new(client: Arc<dyn InferenceClient>, failure_policy: FailurePolicy) -> Self {
        Self {
            client,
            failure_policy,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_configured()
    }

    /// Evaluate every payload; results arrive in completion order
    pub async fn evaluate_batch(
        &self,
        payloads: Vec<AuditPayload>,
        rules: &RuleSet,
        max_concurrency: usize,
    ) -> Vec<AuditResult> {
        let policy = self.failure_policy;
        let instructions = match rules.compact_listing() {
            Ok(listing) => Arc::new(compose_instructions(&listing)),
            Err(e) => {
                let reason = DegradedReason::Composition(format!("rule listing: {}", e));
                tracing::error!(error = %reason, "Cannot compose inference requests");
                return payloads
                    .iter()
                    .map(|p| AuditResult::degraded(p.transaction_id, reason.clone(), policy))
                    .collect();
            }
        };

        let width = max_concurrency.max(1);
        tracing::debug!(
            organization_id = rules.organization_id(),
            transactions = payloads.len(),
            width,
            rules = rules.len(),
            "Evaluating page"
        );

        let shared_rules = Arc::new(rules.clone());
        stream::iter(payloads)
            .map(|payload| {
                let client = Arc::clone(&self.client);
                let rules = Arc::clone(&shared_rules);
                let instructions = Arc::clone(&instructions);
                let transaction_id = payload.transaction_id;

                async move {
                    let task = tokio::spawn(evaluate_one(client, payload, rules, instructions, policy));
                    let outcome = match task.await {
                        Ok(outcome) => outcome,
                        Err(join_error) => Err(DegradedReason::TaskAborted(join_error.to_string())),
                    };
                    outcome.unwrap_or_else(|reason| {
                        tracing::warn!(
                            transaction_id,
                            reason = %reason,
                            policy = ?policy,
                            "Evaluation degraded"
                        );
                        AuditResult::degraded(transaction_id, reason, policy)
                    })
                }
            })
            .buffer_unordered(width)
            .collect()
            .await
    }
}

fn compose_instructions(rule_listing: &str) -> String {
    format!(
        "{}\nRULES: {}",
        AUDIT_INSTRUCTIONS.replace("VERSION", &RESPONSE_SCHEMA_VERSION.to_string()),
        rule_listing
    )
}

async fn evaluate_one(
    client: Arc<dyn InferenceClient>,
    payload: AuditPayload,
    rules: Arc<RuleSet>,
    instructions: Arc<String>,
    policy: FailurePolicy,
) -> Result<AuditResult, DegradedReason> {
    let content = payload
        .to_request_text()
        .map_err(|e| DegradedReason::Composition(e.to_string()))?;

    let request = InferenceRequest {
        transaction_id: payload.transaction_id,
        instructions: String::clone(&instructions),
        content,
        object_refs: payload.object_refs,
    };

    let response = client
        .evaluate(&request)
        .await
        .map_err(|e| DegradedReason::Inference(e.to_string()))?;

    Ok(response_parser::parse(
        &response.text,
        payload.transaction_id,
        &rules,
        response.usage,
        policy,
    ))
}
