//! Deterministic Simulation Testing for the Feed Client
//!
//! Seed-driven workloads run a stream session against a fault-injecting
//! control plane, retrying failed calls the way a caller would, then check
//! delivery invariants against the surviving call log:
//!
//! - every mutation the caller handed over is delivered exactly once
//! - one fresh container per successful flush, never reused
//! - every pushed container followed provision, upload, push in order
//! - exactly one session open and one close, at the edges of the log
//!
//! ```text
//! for seed in 0..N {
//!     let result = FeedDstHarness::new(FeedDstConfig::chaos(seed)).run().await;
//!     assert!(result.is_success(), "{}", result.summary());
//! }
//! ```
//!
//! A failing seed replays exactly, so shrinking a bug is re-running one
//! number.

use crate::batch::StreamBatch;
use crate::config::QueueConfig;
use crate::control::{ControlCall, InMemoryControlPlane};
use crate::error::FeedError;
use crate::mutation::{Document, DocumentDelete, PartialUpdate, UpdateOperator};
use crate::session::StreamSession;
use crate::simulated::{SimulatedControlPlane, SimulatedFaults, SimulatedRng};
use serde_json::json;
use std::collections::{HashMap, HashSet};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for one DST run
#[derive(Debug, Clone)]
pub struct FeedDstConfig {
    /// Random seed; same seed, same run
    pub seed: u64,
    /// Control plane fault probabilities
    pub faults: SimulatedFaults,
    /// Queue budget; small budgets force frequent rotation
    pub queue: QueueConfig,
    /// Number of mutations to feed
    pub operations: usize,
    /// Times one failed call is retried before the run gives up
    pub max_op_retries: u32,
}

impl FeedDstConfig {
    /// No faults; exercises batching and rotation alone
    pub fn calm(seed: u64) -> Self {
        FeedDstConfig {
            seed,
            faults: SimulatedFaults::no_faults(),
            queue: QueueConfig::with_max_queue_size(2000),
            operations: 200,
            max_op_retries: 3,
        }
    }

    /// Occasional faults
    pub fn moderate(seed: u64) -> Self {
        FeedDstConfig {
            seed,
            faults: SimulatedFaults::default(),
            queue: QueueConfig::with_max_queue_size(2000),
            operations: 200,
            max_op_retries: 25,
        }
    }

    /// Aggressive faults
    pub fn chaos(seed: u64) -> Self {
        FeedDstConfig {
            seed,
            faults: SimulatedFaults::high_chaos(),
            queue: QueueConfig::with_max_queue_size(2000),
            operations: 250,
            max_op_retries: 100,
        }
    }
}

// ============================================================================
// Workload
// ============================================================================

/// One mutation the workload feeds
#[derive(Debug, Clone)]
enum FeedOperation {
    Upsert { document_id: String, padding: usize },
    Delete { document_id: String },
    PartialUpdate { document_id: String },
}

impl FeedOperation {
    fn expected(&self) -> ExpectedRecord {
        match self {
            FeedOperation::Upsert { document_id, .. } => {
                ExpectedRecord::Upsert(document_id.clone())
            }
            FeedOperation::Delete { document_id } => ExpectedRecord::Delete(document_id.clone()),
            FeedOperation::PartialUpdate { document_id } => {
                ExpectedRecord::Partial(document_id.clone())
            }
        }
    }
}

/// Shadow record of a successfully fed mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ExpectedRecord {
    Upsert(String),
    Delete(String),
    Partial(String),
}

// ============================================================================
// Result
// ============================================================================

/// Outcome of one DST run
#[derive(Debug, Clone)]
pub struct FeedDstResult {
    pub seed: u64,
    pub operations: usize,
    /// Containers pushed, one per successful flush
    pub flushes: usize,
    pub injected_failures: u64,
    pub violations: Vec<String>,
}

impl FeedDstResult {
    pub fn is_success(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "seed={} ops={} flushes={} injected_failures={} violations={:?}",
            self.seed, self.operations, self.flushes, self.injected_failures, self.violations
        )
    }
}

/// Run one harness per seed in `[start_seed, start_seed + seeds)`
pub async fn run_dst_batch(
    start_seed: u64,
    seeds: u64,
    operations: usize,
    config: impl Fn(u64) -> FeedDstConfig,
) -> Vec<FeedDstResult> {
    let mut results = Vec::with_capacity(seeds as usize);
    for seed in start_seed..start_seed + seeds {
        let mut run_config = config(seed);
        run_config.operations = operations;
        results.push(FeedDstHarness::new(run_config).run().await);
    }
    results
}

/// One-line summary over a batch of runs
pub fn summarize_batch(results: &[FeedDstResult]) -> String {
    let failed = results.iter().filter(|r| !r.is_success()).count();
    let flushes: usize = results.iter().map(|r| r.flushes).sum();
    let injected: u64 = results.iter().map(|r| r.injected_failures).sum();
    format!(
        "{} runs, {} failed, {} flushes, {} injected failures",
        results.len(),
        failed,
        flushes,
        injected
    )
}

// ============================================================================
// Harness
// ============================================================================

/// Drives one stream session through a randomized workload and checks the
/// delivery invariants afterwards
pub struct FeedDstHarness {
    config: FeedDstConfig,
    rng: SimulatedRng,
    plane: InMemoryControlPlane,
    sim: SimulatedControlPlane<InMemoryControlPlane>,
}

impl FeedDstHarness {
    pub fn new(config: FeedDstConfig) -> Self {
        let plane = InMemoryControlPlane::new();
        // Separate streams: the workload consumes the seed, fault decisions
        // consume its complement.
        let sim = SimulatedControlPlane::new(plane.clone(), !config.seed, config.faults.clone());
        FeedDstHarness {
            rng: SimulatedRng::new(config.seed),
            plane,
            sim,
            config,
        }
    }

    /// Run the workload to completion and evaluate invariants
    pub async fn run(mut self) -> FeedDstResult {
        let mut violations = Vec::new();

        let mut session =
            match StreamSession::new(self.sim.clone(), "dst-source", &self.config.queue) {
                Ok(session) => session,
                Err(e) => {
                    violations.push(format!("session construction failed: {}", e));
                    return self.finish(violations);
                }
            };

        let mut fed: Vec<ExpectedRecord> = Vec::new();
        'workload: for index in 0..self.config.operations {
            let operation = self.next_operation(index);
            let mut attempts = 0u32;
            loop {
                match Self::apply(&mut session, &operation).await {
                    Ok(()) => {
                        fed.push(operation.expected());
                        break;
                    }
                    Err(_) if attempts < self.config.max_op_retries => attempts += 1,
                    Err(e) => {
                        violations.push(format!("operation {} exhausted retries: {}", index, e));
                        break 'workload;
                    }
                }
            }
        }

        if violations.is_empty() {
            let mut attempts = 0u32;
            loop {
                match session.close().await {
                    Ok(()) => break,
                    Err(FeedError::NoOpenSession) => {
                        if !fed.is_empty() {
                            violations.push(
                                "close reported no open session after successful mutations"
                                    .to_string(),
                            );
                        }
                        break;
                    }
                    Err(_) if attempts < self.config.max_op_retries => attempts += 1,
                    Err(e) => {
                        violations.push(format!("close exhausted retries: {}", e));
                        break;
                    }
                }
            }
        }

        if violations.is_empty() {
            self.evaluate(&fed, &mut violations);
        }
        self.finish(violations)
    }

    fn next_operation(&mut self, index: usize) -> FeedOperation {
        let document_id = format!("doc-{:05}", index);
        let roll = self.rng.gen_range(0, 100);
        if roll < 70 {
            let padding = self.rng.gen_range(20, 220) as usize;
            FeedOperation::Upsert {
                document_id,
                padding,
            }
        } else if roll < 85 {
            FeedOperation::Delete { document_id }
        } else {
            FeedOperation::PartialUpdate { document_id }
        }
    }

    async fn apply(
        session: &mut StreamSession<SimulatedControlPlane<InMemoryControlPlane>>,
        operation: &FeedOperation,
    ) -> Result<(), FeedError> {
        match operation {
            FeedOperation::Upsert {
                document_id,
                padding,
            } => {
                let document = Document::new(document_id.clone())
                    .with_field("padding", json!("x".repeat(*padding)));
                session.add_document(document).await
            }
            FeedOperation::Delete { document_id } => {
                session
                    .delete_document(DocumentDelete::new(document_id.clone(), false))
                    .await
            }
            FeedOperation::PartialUpdate { document_id } => {
                let update = PartialUpdate::new(
                    document_id.clone(),
                    UpdateOperator::ArrayAppend,
                    "tags",
                    json!(["dst"]),
                )
                .expect("array value satisfies arrayAppend");
                session.add_partial_update(update).await
            }
        }
    }

    /// Check delivery, container, and session invariants against the call
    /// log of successful operations
    fn evaluate(&self, fed: &[ExpectedRecord], violations: &mut Vec<String>) {
        // Exactly-once delivery.
        let mut delivered: HashMap<ExpectedRecord, usize> = HashMap::new();
        for payload in self.plane.pushed_payloads() {
            let batch: StreamBatch = match serde_json::from_slice(&payload) {
                Ok(batch) => batch,
                Err(e) => {
                    violations.push(format!("pushed payload is not a batch envelope: {}", e));
                    continue;
                }
            };
            for document in &batch.add_or_update {
                *delivered
                    .entry(ExpectedRecord::Upsert(document.document_id.clone()))
                    .or_insert(0) += 1;
            }
            for delete in &batch.delete {
                *delivered
                    .entry(ExpectedRecord::Delete(delete.document_id.clone()))
                    .or_insert(0) += 1;
            }
            for update in &batch.partial_update {
                *delivered
                    .entry(ExpectedRecord::Partial(update.document_id().to_string()))
                    .or_insert(0) += 1;
            }
        }

        for record in fed {
            match delivered.get(record) {
                Some(1) => {}
                Some(n) => violations.push(format!("{:?} delivered {} times", record, n)),
                None => violations.push(format!("{:?} was never delivered", record)),
            }
        }
        if delivered.len() != fed.len() {
            violations.push(format!(
                "delivered {} distinct records, fed {}",
                delivered.len(),
                fed.len()
            ));
        }

        // Container lifecycle: pushed containers saw provision, upload,
        // push in order, each exactly once.
        let calls = self.plane.calls();
        let mut provision_at: HashMap<String, usize> = HashMap::new();
        let mut upload_at: HashMap<String, usize> = HashMap::new();
        let mut pushed: HashSet<String> = HashSet::new();
        for (index, call) in calls.iter().enumerate() {
            match call {
                ControlCall::Provision { container_id } => {
                    if provision_at.insert(container_id.clone(), index).is_some() {
                        violations.push(format!("container {} provisioned twice", container_id));
                    }
                }
                ControlCall::Upload { container_id, .. } => {
                    if upload_at.insert(container_id.clone(), index).is_some() {
                        violations.push(format!("container {} uploaded twice", container_id));
                    }
                }
                ControlCall::Push { container_id, .. } => {
                    if !pushed.insert(container_id.clone()) {
                        violations.push(format!("container {} pushed twice", container_id));
                    }
                    match (provision_at.get(container_id), upload_at.get(container_id)) {
                        (Some(p), Some(u)) if *p < *u && *u < index => {}
                        _ => violations.push(format!(
                            "container {} pushed out of lifecycle order",
                            container_id
                        )),
                    }
                }
                ControlCall::OpenSession { .. } | ControlCall::CloseSession { .. } => {}
            }
        }

        // Session lifecycle: one successful open and close, first and last.
        if !fed.is_empty() {
            if self.plane.open_session_count() != 1 {
                violations.push(format!(
                    "{} session opens, expected 1",
                    self.plane.open_session_count()
                ));
            }
            if self.plane.close_session_count() != 1 {
                violations.push(format!(
                    "{} session closes, expected 1",
                    self.plane.close_session_count()
                ));
            }
            if !matches!(calls.first(), Some(ControlCall::OpenSession { .. })) {
                violations.push("first successful call is not the session open".to_string());
            }
            if !matches!(calls.last(), Some(ControlCall::CloseSession { .. })) {
                violations.push("last successful call is not the session close".to_string());
            }
        }
    }

    fn finish(self, violations: Vec<String>) -> FeedDstResult {
        FeedDstResult {
            seed: self.config.seed,
            operations: self.config.operations,
            flushes: self.plane.pushed_count(),
            injected_failures: self.sim.stats().total_failures(),
            violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calm_run_is_clean() {
        let result = FeedDstHarness::new(FeedDstConfig::calm(7)).run().await;

        assert!(result.is_success(), "{}", result.summary());
        assert!(result.flushes > 1);
        assert_eq!(result.injected_failures, 0);
    }

    #[tokio::test]
    async fn test_same_seed_same_run() {
        let a = FeedDstHarness::new(FeedDstConfig::moderate(11)).run().await;
        let b = FeedDstHarness::new(FeedDstConfig::moderate(11)).run().await;

        assert_eq!(a.summary(), b.summary());
    }

    #[tokio::test]
    async fn test_summarize_batch_counts_runs() {
        let mut results = Vec::new();
        for seed in 0..3 {
            results.push(FeedDstHarness::new(FeedDstConfig::calm(seed)).run().await);
        }

        let summary = summarize_batch(&results);
        assert!(summary.starts_with("3 runs, 0 failed"), "{}", summary);
    }
}
