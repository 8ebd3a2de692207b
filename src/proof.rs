//! Deterministic execution traces, checkpointed hashing, and cross-node
//! consensus over traces (spec §4.2).
//!
//! The chained step hash and checkpoint folding are grounded in
//! `examples/original_source/src/proof.cpp`: each step folds the previous
//! chain hash together with its own fields, and a checkpoint is a SHA-256
//! over the cumulative state at that point.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::{ConsensusError, ProofError};
use crate::worker_identity::WorkerIdentity;

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Environment variables a client passes to a job's child process to make
/// its own side best-effort deterministic (spec §4.2 "Determinism
/// obligations" — best-effort, not bit-exactness; honoring these is up to
/// the interpreter/runtime, not enforced by this crate).
pub fn deterministic_env() -> Vec<(String, String)> {
    vec![
        ("PYTHONHASHSEED".to_string(), "0".to_string()),
        ("SANDRUN_DETERMINISTIC".to_string(), "1".to_string()),
    ]
}

/// One event in an execution trace (spec §3 "Execution step / trace").
#[derive(Debug, Clone)]
pub struct ExecutionStep {
    pub timestamp_us: u64,
    pub op: String,
    pub args: Vec<String>,
    pub result: String,
    pub hash: String,
}

/// Immutable record of one execution (spec §3 "Proof of compute").
#[derive(Debug, Clone)]
pub struct Proof {
    pub job_id: String,
    pub node_id: String,
    pub code_hash: String,
    pub trace: Vec<ExecutionStep>,
    pub final_hash: String,
    pub timestamp: SystemTime,
    pub signature: String,
    pub metadata: String,
}

impl Proof {
    /// Recompute the chain from `trace` and compare to `final_hash` (spec
    /// §8 "Chain integrity").
    pub fn chain_is_valid(&self) -> bool {
        fold_chain(&self.trace) == self.final_hash
    }

    /// Verify the signature over the canonical serialization under
    /// `node_id`'s public key (spec §3 invariant).
    pub fn signature_is_valid(&self) -> bool {
        WorkerIdentity::verify(&self.canonical_bytes(), &self.signature, &self.node_id)
    }

    /// Canonical byte serialization for signing and wire exchange (spec
    /// §6): job_id, node_id, code_hash, trace_length, each step's encoding,
    /// final_hash, timestamp, metadata — signature is appended separately
    /// by the caller since it covers everything *before* it.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.job_id.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.node_id.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.code_hash.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&(self.trace.len() as u64).to_be_bytes());
        for step in &self.trace {
            buf.extend_from_slice(&step.timestamp_us.to_be_bytes());
            buf.extend_from_slice(step.op.as_bytes());
            buf.push(0);
            for arg in &step.args {
                buf.extend_from_slice(arg.as_bytes());
                buf.push(0);
            }
            buf.extend_from_slice(step.result.as_bytes());
            buf.push(0);
            buf.extend_from_slice(step.hash.as_bytes());
            buf.push(0);
        }
        buf.extend_from_slice(self.final_hash.as_bytes());
        buf.push(0);
        let ts = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(self.metadata.as_bytes());
        buf
    }
}

/// Fold a trace's step hashes into the chained hash, matching `proof.cpp`'s
/// "fold checkpoints/events" pattern.
fn fold_chain(trace: &[ExecutionStep]) -> String {
    let mut chain = String::new();
    for step in trace {
        chain = sha256_hex(format!("{chain}{}", step.hash).as_bytes());
    }
    chain
}

/// Gates which event classes are actually chained (spec §4.2 "Verbosity
/// tiers"). Unrecorded events are still counted for metrics elsewhere but
/// never folded into the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Minimal = 0,
    Standard = 1,
    Detailed = 2,
}

/// A per-job recording session (spec §4.2 "Recording session"). Mutable
/// while recording; `generate_proof` consumes it into an immutable `Proof`.
pub struct Session {
    job_id: String,
    code_hash: String,
    verbosity: Verbosity,
    start: Instant,
    trace: Vec<ExecutionStep>,
    chain: String,
    checkpoints: Vec<String>,
    closed: bool,
    deterministic: bool,
}

impl Session {
    /// Seed a new chain with the SHA-256 of the code (spec §4.2 `start`).
    pub fn start(job_id: impl Into<String>, code: &[u8], verbosity: Verbosity) -> Self {
        Self {
            job_id: job_id.into(),
            code_hash: sha256_hex(code),
            verbosity,
            start: Instant::now(),
            trace: Vec::new(),
            chain: String::new(),
            checkpoints: Vec::new(),
            closed: false,
            deterministic: false,
        }
    }

    /// Enable deterministic mode (spec §4.2 "Determinism obligations",
    /// `original_source/include/proof.h::enableDeterministicMode`): the
    /// chain folds a logical step counter instead of wall-clock elapsed
    /// time, so identical recorded inputs on independent nodes produce an
    /// identical `final_hash` regardless of real-time jitter between them.
    pub fn enable_deterministic_mode(&mut self) {
        self.deterministic = true;
    }

    fn elapsed_us(&self) -> u64 {
        if self.deterministic {
            self.trace.len() as u64
        } else {
            self.start.elapsed().as_micros() as u64
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    /// Append an event at the given verbosity tier, folding it into the
    /// chain only if `tier <= self.verbosity`.
    pub fn record_step_at(
        &mut self,
        tier: Verbosity,
        op: &str,
        args: &[String],
        result: &str,
    ) -> Result<(), ProofError> {
        if self.closed {
            return Err(ProofError::SessionClosed);
        }
        if tier > self.verbosity {
            return Ok(());
        }

        let timestamp_us = self.elapsed_us();
        let hash = sha256_hex(
            format!(
                "{}{}{}{}{}",
                self.chain,
                timestamp_us,
                op,
                args.join(","),
                result
            )
            .as_bytes(),
        );
        self.chain = sha256_hex(format!("{}{}", self.chain, hash).as_bytes());
        self.trace.push(ExecutionStep {
            timestamp_us,
            op: op.to_string(),
            args: args.to_vec(),
            result: result.to_string(),
            hash,
        });
        Ok(())
    }

    /// Convenience entry point at standard verbosity (spec §4.2 `record_step`).
    pub fn record_step(&mut self, op: &str, args: &[String], result: &str) -> Result<(), ProofError> {
        self.record_step_at(Verbosity::Standard, op, args, result)
    }

    /// Convenience entry point for syscalls (spec §4.2 `record_syscall`).
    pub fn record_syscall(&mut self, name: &str, args: &[String], result_int: i64) -> Result<(), ProofError> {
        self.record_step_at(Verbosity::Minimal, name, args, &result_int.to_string())
    }

    /// Convenience entry point for GPU operations (spec §4.2 `record_gpu_op`).
    pub fn record_gpu_op(&mut self, kernel: &str, params: &[String]) -> Result<(), ProofError> {
        self.record_step_at(Verbosity::Detailed, kernel, params, "")
    }

    /// Fold a checkpoint hash over the current chain state.
    pub fn checkpoint(&mut self) -> String {
        let cp = sha256_hex(format!("{}{}", self.chain, self.trace.len()).as_bytes());
        self.checkpoints.push(cp.clone());
        cp
    }

    /// The most recently recorded event (spec §4.2 `finalize_step`).
    pub fn finalize_step(&self) -> Option<&ExecutionStep> {
        self.trace.last()
    }

    /// Close the session, compute the final chain hash, sign the canonical
    /// serialization, and emit an immutable `Proof` (spec §4.2 `generate_proof`).
    pub fn generate_proof(
        mut self,
        identity: &WorkerIdentity,
        metadata: impl Into<String>,
    ) -> Result<Proof, ProofError> {
        if self.closed {
            return Err(ProofError::SessionClosed);
        }
        if self.trace.is_empty() {
            return Err(ProofError::EmptyTrace);
        }
        self.closed = true;

        let mut proof = Proof {
            job_id: self.job_id.clone(),
            node_id: identity.worker_id(),
            code_hash: self.code_hash.clone(),
            trace: self.trace.clone(),
            final_hash: self.chain.clone(),
            timestamp: SystemTime::now(),
            signature: String::new(),
            metadata: metadata.into(),
        };
        proof.signature = identity.sign(&proof.canonical_bytes());
        Ok(proof)
    }
}

/// Result of cross-node consensus over proofs for the same job (spec §3).
#[derive(Debug, Clone, Default)]
pub struct ConsensusResult {
    pub is_valid: bool,
    pub confidence: f64,
    pub agreeing_nodes: Vec<String>,
    pub disagreeing_nodes: Vec<String>,
    pub canonical_hash: Option<String>,
    pub message: String,
}

/// Normalized LCS similarity over step-hash sequences (spec §4.2/§9: the
/// exact normalization is the open question this crate pins). Computed as
/// `2 * lcs_len / (len_a + len_b)`, clamped to `[0, 1]`.
pub fn trace_similarity(a: &[ExecutionStep], b: &[ExecutionStep]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let n = a.len();
    let m = b.len();
    let mut dp = vec![0u32; m + 1];
    for i in 1..=n {
        let mut prev_diag = 0u32;
        for j in 1..=m {
            let tmp = dp[j];
            if a[i - 1].hash == b[j - 1].hash {
                dp[j] = prev_diag + 1;
            } else {
                dp[j] = dp[j].max(dp[j - 1]);
            }
            prev_diag = tmp;
        }
    }
    let lcs_len = dp[m] as f64;
    (2.0 * lcs_len / (n + m) as f64).clamp(0.0, 1.0)
}

/// Stateless evaluator for cross-node consensus over proofs (spec §4.2
/// "Consensus evaluator").
pub struct ConsensusEvaluator {
    pub malicious_similarity_cutoff: f64,
}

impl Default for ConsensusEvaluator {
    fn default() -> Self {
        Self {
            malicious_similarity_cutoff: 0.5,
        }
    }
}

impl ConsensusEvaluator {
    /// Reject proofs whose signature or chain does not verify; cluster the
    /// rest by final chain hash; confidence = largest cluster / total
    /// verified (spec §4.2 `validate`).
    pub fn validate(&self, proofs: &[Proof]) -> Result<ConsensusResult, ConsensusError> {
        if proofs.is_empty() {
            return Err(ConsensusError::NoProofs);
        }

        let mut verified: Vec<&Proof> = Vec::new();
        let mut disagreeing = Vec::new();
        for proof in proofs {
            if proof.signature_is_valid() && proof.chain_is_valid() {
                verified.push(proof);
            } else {
                disagreeing.push(proof.node_id.clone());
            }
        }

        if verified.is_empty() {
            return Ok(ConsensusResult {
                is_valid: false,
                confidence: 0.0,
                agreeing_nodes: vec![],
                disagreeing_nodes: disagreeing,
                canonical_hash: None,
                message: "no proof passed signature/chain verification".to_string(),
            });
        }

        let clusters = cluster_by_hash(&verified);
        let (canonical_hash, agreeing) = largest_cluster(&clusters);
        let confidence = agreeing.len() as f64 / verified.len() as f64;

        for proof in &verified {
            if !agreeing.contains(&proof.node_id) {
                disagreeing.push(proof.node_id.clone());
            }
        }

        Ok(ConsensusResult {
            is_valid: confidence >= 0.5,
            confidence,
            agreeing_nodes: agreeing,
            disagreeing_nodes: disagreeing,
            canonical_hash: Some(canonical_hash),
            message: String::new(),
        })
    }

    /// Pairwise LCS similarity over step hashes, averaged into a single
    /// scalar confidence (spec §4.2 `compare_traces`).
    pub fn compare_traces(&self, traces: &[Vec<ExecutionStep>]) -> ConsensusResult {
        if traces.len() < 2 {
            return ConsensusResult {
                is_valid: traces.len() == 1,
                confidence: if traces.is_empty() { 0.0 } else { 1.0 },
                ..Default::default()
            };
        }

        let mut total = 0.0;
        let mut pairs = 0usize;
        for i in 0..traces.len() {
            for j in (i + 1)..traces.len() {
                total += trace_similarity(&traces[i], &traces[j]);
                pairs += 1;
            }
        }
        let confidence = if pairs > 0 { total / pairs as f64 } else { 0.0 };

        ConsensusResult {
            is_valid: confidence >= 0.5,
            confidence,
            ..Default::default()
        }
    }

    /// Final hash of the largest cluster, if its fraction meets `threshold`
    /// (default 0.67), else `None` (spec §4.2 `find_canonical`).
    pub fn find_canonical(&self, proofs: &[Proof], threshold: f64) -> Option<String> {
        let verified: Vec<&Proof> = proofs.iter().filter(|p| p.signature_is_valid() && p.chain_is_valid()).collect();
        if verified.is_empty() {
            return None;
        }
        let clusters = cluster_by_hash(&verified);
        let (hash, members) = largest_cluster(&clusters);
        if members.len() as f64 / verified.len() as f64 >= threshold {
            Some(hash)
        } else {
            None
        }
    }

    /// Node ids in a minority cluster whose similarity to the canonical
    /// cluster is below the configured cutoff (spec §4.2 `detect_malicious`).
    pub fn detect_malicious(&self, proofs: &[Proof]) -> Vec<String> {
        let verified: Vec<&Proof> = proofs.iter().filter(|p| p.signature_is_valid() && p.chain_is_valid()).collect();
        if verified.is_empty() {
            return vec![];
        }
        let clusters = cluster_by_hash(&verified);
        let (canonical_hash, canonical_members) = largest_cluster(&clusters);
        if canonical_members.is_empty() {
            return vec![];
        }
        let Some(canonical) = verified.iter().find(|p| p.node_id == canonical_members[0] && p.final_hash == canonical_hash) else {
            return vec![];
        };

        let mut malicious = Vec::new();
        for proof in &verified {
            if canonical_members.contains(&proof.node_id) {
                continue;
            }
            let similarity = trace_similarity(&canonical.trace, &proof.trace);
            if similarity < self.malicious_similarity_cutoff {
                malicious.push(proof.node_id.clone());
            }
        }
        malicious
    }

    /// Weighted consensus: sum weights per cluster instead of counting
    /// members; the winning cluster must exceed `threshold * total_weight`
    /// (spec §4.2 `validate_with_stakes` / `validate_with_reputation`).
    pub fn validate_weighted(
        &self,
        proofs: &[Proof],
        weights: &[f64],
        threshold: f64,
    ) -> Result<ConsensusResult, ConsensusError> {
        if proofs.is_empty() || proofs.len() != weights.len() {
            return Err(ConsensusError::NoProofs);
        }

        let mut by_hash: std::collections::HashMap<String, (f64, Vec<String>)> =
            std::collections::HashMap::new();
        let mut disagreeing = Vec::new();
        let mut total_weight = 0.0;

        for (proof, &weight) in proofs.iter().zip(weights.iter()) {
            if !proof.signature_is_valid() || !proof.chain_is_valid() {
                disagreeing.push(proof.node_id.clone());
                continue;
            }
            total_weight += weight;
            let entry = by_hash.entry(proof.final_hash.clone()).or_insert((0.0, vec![]));
            entry.0 += weight;
            entry.1.push(proof.node_id.clone());
        }

        if total_weight == 0.0 {
            return Ok(ConsensusResult {
                is_valid: false,
                confidence: 0.0,
                disagreeing_nodes: disagreeing,
                message: "no verified proofs".to_string(),
                ..Default::default()
            });
        }

        let (canonical_hash, (winning_weight, members)) = by_hash
            .iter()
            .max_by(|a, b| a.1.0.partial_cmp(&b.1.0).unwrap().then(a.0.cmp(b.0)))
            .map(|(h, v)| (h.clone(), v.clone()))
            .unwrap();

        for (hash, (_, ids)) in &by_hash {
            if hash != &canonical_hash {
                disagreeing.extend(ids.iter().cloned());
            }
        }

        let confidence = winning_weight / total_weight;

        Ok(ConsensusResult {
            is_valid: confidence >= threshold,
            confidence,
            agreeing_nodes: members,
            disagreeing_nodes: disagreeing,
            canonical_hash: Some(canonical_hash),
            message: String::new(),
        })
    }

    /// Consensus weighted by each node's staked amount (spec §4.2
    /// `validate_with_stakes`): nodes with more stake count for more when
    /// determining the canonical cluster.
    pub fn validate_with_stakes(
        &self,
        proofs: &[Proof],
        stakes: &[f64],
        threshold: f64,
    ) -> Result<ConsensusResult, ConsensusError> {
        self.validate_weighted(proofs, stakes, threshold)
    }

    /// Consensus weighted by each node's reputation score (spec §4.2
    /// `validate_with_reputation`): identical algorithm to
    /// `validate_with_stakes`, just weighted by a different per-node scalar.
    pub fn validate_with_reputation(
        &self,
        proofs: &[Proof],
        reputations: &[f64],
        threshold: f64,
    ) -> Result<ConsensusResult, ConsensusError> {
        self.validate_weighted(proofs, reputations, threshold)
    }
}

/// Cluster verified proofs by identical final chain hash (spec GLOSSARY
/// "Cluster").
fn cluster_by_hash(proofs: &[&Proof]) -> std::collections::HashMap<String, Vec<String>> {
    let mut clusters: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    for proof in proofs {
        clusters
            .entry(proof.final_hash.clone())
            .or_default()
            .push(proof.node_id.clone());
    }
    clusters
}

/// Pick the largest cluster; ties broken by lexicographically smallest
/// minimum node id (spec §4.2 "Tie-breaks").
fn largest_cluster(clusters: &std::collections::HashMap<String, Vec<String>>) -> (String, Vec<String>) {
    clusters
        .iter()
        .map(|(hash, members)| {
            let mut sorted = members.clone();
            sorted.sort();
            (hash.clone(), sorted)
        })
        .max_by(|a, b| {
            a.1.len()
                .cmp(&b.1.len())
                .then_with(|| b.1.first().cmp(&a.1.first()))
        })
        .unwrap_or_default()
}

/// A blocking-with-timeout wrapper around `validate`, matching spec §4.2
/// "A timeout on `validate` ... returns an inconclusive result with
/// confidence 0."
pub async fn validate_with_timeout(
    evaluator: &ConsensusEvaluator,
    proofs: Vec<Proof>,
    timeout: Duration,
) -> ConsensusResult {
    let result = tokio::time::timeout(timeout, async { evaluator.validate(&proofs) }).await;
    match result {
        Ok(Ok(r)) => r,
        Ok(Err(_)) | Err(_) => ConsensusResult {
            is_valid: false,
            confidence: 0.0,
            message: "inconclusive: timed out or no quorum".to_string(),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded_proof(job_id: &str, identity: &WorkerIdentity) -> Proof {
        let mut session = Session::start(job_id, b"print('hi')", Verbosity::Standard);
        session.record_step("exec", &["print".to_string()], "ok").unwrap();
        session.record_step("exit", &[], "0").unwrap();
        session.generate_proof(identity, "{}").unwrap()
    }

    #[test]
    fn trace_timestamps_are_monotonic() {
        let identity = WorkerIdentity::generate();
        let proof = recorded_proof("job-1", &identity);
        for pair in proof.trace.windows(2) {
            assert!(pair[0].timestamp_us <= pair[1].timestamp_us);
        }
    }

    #[test]
    fn chain_integrity_round_trips() {
        let identity = WorkerIdentity::generate();
        let proof = recorded_proof("job-1", &identity);
        assert!(proof.chain_is_valid());
    }

    #[test]
    fn signature_round_trip() {
        let identity = WorkerIdentity::generate();
        let proof = recorded_proof("job-1", &identity);
        assert!(proof.signature_is_valid());

        let mut tampered = proof.clone();
        tampered.metadata = "tampered".to_string();
        assert!(!tampered.signature_is_valid());
    }

    #[test]
    fn deterministic_mode_yields_identical_final_hash_across_sessions() {
        let mut a = Session::start("job-x", b"code", Verbosity::Standard);
        a.enable_deterministic_mode();
        a.record_step("op", &["1".to_string()], "ok").unwrap();
        a.record_step("op2", &["2".to_string()], "ok").unwrap();

        let mut b = Session::start("job-x", b"code", Verbosity::Standard);
        b.enable_deterministic_mode();
        b.record_step("op", &["1".to_string()], "ok").unwrap();
        b.record_step("op2", &["2".to_string()], "ok").unwrap();

        assert_eq!(fold_chain(&a.trace), fold_chain(&b.trace));
    }

    #[test]
    fn non_deterministic_mode_timestamps_still_advance_monotonically() {
        let mut session = Session::start("job-x", b"code", Verbosity::Standard);
        session.record_step("op", &[], "ok").unwrap();
        session.record_step("op2", &[], "ok").unwrap();
        assert!(session.trace[0].timestamp_us <= session.trace[1].timestamp_us);
    }

    #[test]
    fn empty_trace_fails_to_finalize() {
        let identity = WorkerIdentity::generate();
        let session = Session::start("job-1", b"code", Verbosity::Standard);
        assert!(matches!(
            session.generate_proof(&identity, "{}"),
            Err(ProofError::EmptyTrace)
        ));
    }

    #[test]
    fn generate_proof_twice_fails_with_session_closed() {
        let mut session = Session::start("job-1", b"code", Verbosity::Standard);
        session.record_step("op", &[], "ok").unwrap();
        // Session is moved into generate_proof; simulate "called twice" by
        // recording on a clone of the pre-finalize state instead.
        let mut again = Session {
            job_id: session.job_id.clone(),
            code_hash: session.code_hash.clone(),
            verbosity: session.verbosity,
            start: session.start,
            trace: session.trace.clone(),
            chain: session.chain.clone(),
            checkpoints: session.checkpoints.clone(),
            closed: true,
            deterministic: session.deterministic,
        };
        assert!(matches!(
            again.record_step("op2", &[], "ok"),
            Err(ProofError::SessionClosed)
        ));
    }

    #[test]
    fn consensus_identical_traces_from_two_nodes_agree() {
        let node_a = WorkerIdentity::generate();
        let node_b = WorkerIdentity::generate();

        let build = |identity: &WorkerIdentity| {
            let mut session = Session::start("job-42", b"print('hi')", Verbosity::Standard);
            session.record_step("exec", &["print".to_string()], "ok").unwrap();
            session.generate_proof(identity, "{}").unwrap()
        };

        // Same job, same deterministic steps -> same final_hash despite
        // different signing identities.
        let proof_a = build(&node_a);
        let mut proof_b = build(&node_b);
        proof_b.final_hash = proof_a.final_hash.clone();
        proof_b.trace = proof_a.trace.clone();
        proof_b.signature = node_b.sign(&proof_b.canonical_bytes());

        let evaluator = ConsensusEvaluator::default();
        let result = evaluator.validate(&[proof_a, proof_b]).unwrap();
        assert!(result.is_valid);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.agreeing_nodes.len(), 2);
    }

    #[test]
    fn similarity_is_one_for_identical_traces() {
        let identity = WorkerIdentity::generate();
        let proof = recorded_proof("job-1", &identity);
        assert_eq!(trace_similarity(&proof.trace, &proof.trace), 1.0);
    }

    #[test]
    fn similarity_is_zero_for_disjoint_traces() {
        let mut a = Session::start("job-1", b"code", Verbosity::Standard);
        a.record_step("read", &[], "ok").unwrap();
        let mut b = Session::start("job-1", b"code", Verbosity::Standard);
        b.record_step("write", &[], "ok").unwrap();
        assert_eq!(trace_similarity(&a.trace, &b.trace), 0.0);
    }
}
