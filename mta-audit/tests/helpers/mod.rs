//! Test Helper Utilities
//!
//! Temporary databases, seed data and a scripted inference client for
//! driving the audit runner without a network.

#![allow(dead_code)]

use async_trait::async_trait;
use mta_audit::db::SqliteRuleRepository;
use mta_audit::models::Usage;
use mta_audit::services::{
    AuditRunner, EvaluationEngine, InferenceClient, InferenceError, InferenceRequest,
    InferenceResponse, RunnerSettings, HmacUrlSigner, TransactionAssembler,
};
use mta_common::config::FailurePolicy;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CALL_USAGE: Usage = Usage {
    input_units: 100,
    output_units: 20,
    total_units: 120,
};

/// Database living in a temp dir for the duration of a test
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().unwrap();
    let pool = mta_audit::db::init_database(&dir.path().join("audit.db"))
        .await
        .unwrap();
    TestDb { pool, _dir: dir }
}

pub async fn seed_organization(pool: &SqlitePool, id: i64, allow_business_status_update: bool) {
    sqlx::query("INSERT INTO organizations (id, name, allow_business_status_update) VALUES (?, ?, ?)")
        .bind(id)
        .bind(format!("Org {}", id))
        .bind(allow_business_status_update)
        .execute(pool)
        .await
        .unwrap();
}

/// Insert an active rule; `reject` controls its action kind
pub async fn seed_rule(pool: &SqlitePool, organization_id: i64, id: i64, reject: bool) {
    let actions = if reject {
        r#"[{"kind":"reject","message":"block transfer"}]"#
    } else {
        r#"[{"kind":"flag"}]"#
    };
    sqlx::query(
        "INSERT INTO audit_rules (id, organization_id, rule_code, name, rule_type, condition, actions)
         VALUES (?, ?, ?, ?, 'weight', ?, ?)",
    )
    .bind(id)
    .bind(organization_id)
    .bind(format!("RULE-{}", id))
    .bind(format!("Rule {}", id))
    .bind(r#"{"kind":"comparison","field":"net_weight","comparator":"gt","value":0}"#)
    .bind(actions)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn seed_transaction(pool: &SqlitePool, organization_id: i64, id: i64) {
    sqlx::query(
        "INSERT INTO transactions
             (id, organization_id, reference_no, material_type, gross_weight, tare_weight,
              net_weight, unit, recorded_at)
         VALUES (?, ?, ?, 'scrap steel', 30000, 12000, 18000, 'kg', ?)",
    )
    .bind(id)
    .bind(organization_id)
    .bind(format!("WB-{}", id))
    .bind(mta_common::time::to_db(mta_common::time::now()))
    .execute(pool)
    .await
    .unwrap();
}

/// Transaction logged without gross or net weight
pub async fn seed_transaction_missing_weights(pool: &SqlitePool, organization_id: i64, id: i64) {
    sqlx::query(
        "INSERT INTO transactions
             (id, organization_id, reference_no, material_type, tare_weight, unit, recorded_at)
         VALUES (?, ?, ?, 'scrap steel', 12000, 'kg', ?)",
    )
    .bind(id)
    .bind(organization_id)
    .bind(format!("WB-{}", id))
    .bind(mta_common::time::to_db(mta_common::time::now()))
    .execute(pool)
    .await
    .unwrap();
}

/// Run a raw statement, e.g. to plant a trigger or corrupt a column
pub async fn execute(pool: &SqlitePool, sql: &str) {
    sqlx::query(sql).execute(pool).await.unwrap();
}

pub async fn seed_transactions(pool: &SqlitePool, organization_id: i64, ids: impl IntoIterator<Item = i64>) {
    for id in ids {
        seed_transaction(pool, organization_id, id).await;
    }
}

pub async fn seed_image(pool: &SqlitePool, transaction_id: i64, key: &str) {
    sqlx::query(
        "INSERT INTO transaction_attachments (transaction_id, object_key, content_type, kind)
         VALUES (?, ?, 'image/jpeg', 'weighbridge_ticket')",
    )
    .bind(transaction_id)
    .bind(key)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn audit_status(pool: &SqlitePool, id: i64) -> String {
    sqlx::query_scalar("SELECT audit_status FROM transactions WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn business_status(pool: &SqlitePool, id: i64) -> String {
    sqlx::query_scalar("SELECT business_status FROM transactions WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn batch_id_of(pool: &SqlitePool, id: i64) -> Option<i64> {
    sqlx::query_scalar("SELECT batch_id FROM transactions WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn batch_row_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM audit_batches")
        .fetch_one(pool)
        .await
        .unwrap()
}

/// How the scripted client answers one transaction
#[derive(Debug, Clone)]
pub enum Script {
    /// Well-formed response listing these rule ids
    Violations(Vec<i64>),
    /// Reports this rule when the payload has no net weight
    FlagMissingWeight(i64),
    /// Transport failure
    Fail,
    /// Unparseable model text
    Garbage,
    /// Worker task panics
    Panic,
}

/// In-process inference client answering from a per-transaction script
pub struct ScriptedInferenceClient {
    script: HashMap<i64, Script>,
    default: Script,
    delay: Duration,
    configured: bool,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl ScriptedInferenceClient {
    /// Approves everything
    pub fn approving() -> Self {
        Self {
            script: HashMap::new(),
            default: Script::Violations(Vec::new()),
            delay: Duration::from_millis(5),
            configured: true,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_default(mut self, default: Script) -> Self {
        self.default = default;
        self
    }

    pub fn with(mut self, transaction_id: i64, script: Script) -> Self {
        self.script.insert(transaction_id, script);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for ScriptedInferenceClient {
    async fn evaluate(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        if !self.configured {
            return Err(InferenceError::MissingCredential);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let id = request.transaction_id;
        match self.script.get(&id).unwrap_or(&self.default) {
            Script::Violations(rule_ids) => Ok(violations_response(id, rule_ids)),
            Script::FlagMissingWeight(rule_id) => {
                let fired = if request.content.contains(r#""net_weight":null"#) {
                    vec![*rule_id]
                } else {
                    Vec::new()
                };
                Ok(violations_response(id, &fired))
            }
            Script::Fail => Err(InferenceError::Network("connection reset".to_string())),
            Script::Garbage => Ok(InferenceResponse {
                text: "Sorry, I can't evaluate this transaction.".to_string(),
                usage: CALL_USAGE,
            }),
            Script::Panic => panic!("scripted worker panic for transaction {}", id),
        }
    }

    fn is_configured(&self) -> bool {
        self.configured
    }
}

fn violations_response(transaction_id: i64, rule_ids: &[i64]) -> InferenceResponse {
    let entries: Vec<String> = rule_ids
        .iter()
        .map(|rule| format!(r#"{{"i":{},"m":"rule {} fired"}}"#, rule, rule))
        .collect();
    InferenceResponse {
        text: format!(r#"{{"v":1,"t":{},"r":[{}]}}"#, transaction_id, entries.join(",")),
        usage: CALL_USAGE,
    }
}

pub fn settings(max_concurrency: usize, page_size: u32, time_budget: Duration) -> RunnerSettings {
    RunnerSettings {
        max_concurrency,
        page_size,
        time_budget,
    }
}

pub fn build_test_runner(
    pool: &SqlitePool,
    client: Arc<ScriptedInferenceClient>,
    settings: RunnerSettings,
    policy: FailurePolicy,
) -> AuditRunner {
    let signer = Arc::new(HmacUrlSigner::new(
        "https://objects.test",
        Some("test-secret".to_string()),
        300,
    ));
    AuditRunner::new(
        pool.clone(),
        Arc::new(SqliteRuleRepository::new(pool.clone())),
        TransactionAssembler::new(pool.clone(), signer),
        EvaluationEngine::new(client, policy),
        settings,
    )
}

pub fn default_runner(pool: &SqlitePool, client: Arc<ScriptedInferenceClient>) -> AuditRunner {
    build_test_runner(
        pool,
        client,
        settings(4, 200, Duration::from_secs(30)),
        FailurePolicy::FailOpen,
    )
}
