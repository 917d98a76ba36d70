//! Audit orchestration services

pub mod audit_runner;
pub mod batch_enqueuer;
pub mod evaluation_engine;
pub mod inference_client;
pub mod object_signer;
pub mod response_parser;
pub mod status_reconciler;
pub mod transaction_assembler;

pub use audit_runner::{AuditRunner, AuditScheduler, RunnerSettings, RunSummary};
pub use batch_enqueuer::BatchEnqueuer;
pub use evaluation_engine::EvaluationEngine;
pub use inference_client::{HttpInferenceClient, InferenceClient, InferenceError, InferenceRequest, InferenceResponse};
pub use object_signer::{ObjectRef, ObjectUrlSigner, HmacUrlSigner};
pub use status_reconciler::{ReconcileReport, StatusReconciler};
pub use transaction_assembler::{AuditPayload, TransactionAssembler};
