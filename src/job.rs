//! The shared `Job` data model (spec §3) and its lifecycle state machine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// One of the six supported interpreters (spec §3), matching
/// `examples/original_source/include/sandbox.h`'s `InterpreterType` enum
/// one-for-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterTag {
    Python,
    NodeJs,
    Rust,
    Go,
    Cpp,
    Cuda,
}

impl InterpreterTag {
    /// File extension used for the written code file (spec §4.1 step 1).
    pub fn extension(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::NodeJs => "js",
            Self::Rust => "rs",
            Self::Go => "go",
            Self::Cpp => "cpp",
            Self::Cuda => "cu",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "python" => Some(Self::Python),
            "nodejs" => Some(Self::NodeJs),
            "rust" => Some(Self::Rust),
            "go" => Some(Self::Go),
            "cpp" => Some(Self::Cpp),
            "cuda" => Some(Self::Cuda),
            _ => None,
        }
    }
}

/// The resource-limit bundle (spec §3). All limits must be positive; zero
/// means "disallow entirely" — enforced by the constructors below, not by
/// any field invariant on this struct alone.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_memory_bytes: u64,
    pub max_cpu_seconds: u64,
    pub max_wall_seconds: u64,
    pub max_output_file_bytes: u64,
    pub max_processes: u32,
    pub max_open_files: u32,
    pub max_gpu_memory_bytes: Option<u64>,
}

impl ResourceLimits {
    pub const DEFAULT_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
    pub const DEFAULT_CPU_SECONDS: u64 = 10;
    pub const DEFAULT_WALL_SECONDS: u64 = 300;
    pub const DEFAULT_OUTPUT_FILE_BYTES: u64 = 100 * 1024 * 1024;

    pub fn wall_timeout(&self) -> Duration {
        Duration::from_secs(self.max_wall_seconds)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: Self::DEFAULT_MEMORY_BYTES,
            max_cpu_seconds: Self::DEFAULT_CPU_SECONDS,
            max_wall_seconds: Self::DEFAULT_WALL_SECONDS,
            max_output_file_bytes: Self::DEFAULT_OUTPUT_FILE_BYTES,
            max_processes: 32,
            max_open_files: 256,
            max_gpu_memory_bytes: None,
        }
    }
}

/// Security tier governing process isolation (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityTier {
    Minimal,
    Standard,
    Paranoid,
    GpuSecure,
}

/// Job lifecycle state (spec §3). Transitions are monotone; terminal states
/// are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Killed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Killed)
    }

    /// Whether `self -> next` is a legal monotone transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running) | (Running, Done) | (Running, Failed) | (Running, Killed)
        )
    }
}

/// The unit of work (spec §3 "Job").
pub struct Job {
    pub id: String,
    pub subject_id: String,
    pub code: Vec<u8>,
    pub interpreter: InterpreterTag,
    pub limits: ResourceLimits,
    pub gpu_device: Option<usize>,
    state: JobState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub cpu_seconds: f64,
    pub peak_memory_bytes: u64,
    pub wall_time: Duration,
    pub output_files: Vec<PathBuf>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        subject_id: impl Into<String>,
        code: Vec<u8>,
        interpreter: InterpreterTag,
        limits: ResourceLimits,
        gpu_device: Option<usize>,
    ) -> Self {
        Self {
            id: id.into(),
            subject_id: subject_id.into(),
            code,
            interpreter,
            limits,
            gpu_device,
            state: JobState::Queued,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            cpu_seconds: 0.0,
            peak_memory_bytes: 0,
            wall_time: Duration::ZERO,
            output_files: Vec::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Transition to `next`, enforcing the monotone state machine (spec §3
    /// invariant: "transitions are monotone").
    pub fn transition(&mut self, next: JobState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!("illegal transition {:?} -> {:?}", self.state, next));
        }
        self.state = next;
        Ok(())
    }
}

/// Default retention window for a terminal job's record (spec §3: "terminal
/// jobs are purged after a short retention (≤ 60 s) unless retrieved").
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

/// In-memory job registry with privacy-driven retention, grounded in
/// `original_source/src/main.cpp`'s executor loop: a mutex-guarded job map,
/// swept once per tick for terminal jobs past their age, plus a
/// `GET /result/{id}` path that auto-deletes on read.
pub struct JobStore {
    jobs: RwLock<HashMap<String, (Instant, Job)>>,
    retention: Duration,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl JobStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub async fn insert(&self, job: Job) {
        let id = job.id.clone();
        self.jobs.write().await.insert(id, (Instant::now(), job));
    }

    pub async fn state(&self, id: &str) -> Option<JobState> {
        self.jobs.read().await.get(id).map(|(_, job)| job.state())
    }

    /// Retrieve and immediately remove a job's record (spec §3: "unless
    /// retrieved" — retrieval itself consumes the retention window).
    pub async fn take(&self, id: &str) -> Option<Job> {
        self.jobs.write().await.remove(id).map(|(_, job)| job)
    }

    /// Remove every terminal job older than the configured retention.
    /// Running jobs are never purged regardless of age.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        let retention = self.retention;
        self.jobs.write().await.retain(|_, (inserted_at, job)| {
            !(job.state().is_terminal() && now.duration_since(*inserted_at) > retention)
        });
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_succeed() {
        let mut job = Job::new("j1", "s1", vec![], InterpreterTag::Python, ResourceLimits::default(), None);
        assert!(job.transition(JobState::Running).is_ok());
        assert!(job.transition(JobState::Done).is_ok());
        assert!(job.state().is_terminal());
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut job = Job::new("j1", "s1", vec![], InterpreterTag::Python, ResourceLimits::default(), None);
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Failed).unwrap();
        assert!(job.transition(JobState::Running).is_err());
    }

    #[test]
    fn interpreter_tag_parses_known_tags_only() {
        assert_eq!(InterpreterTag::parse("python"), Some(InterpreterTag::Python));
        assert_eq!(InterpreterTag::parse("brainfuck"), None);
    }

    fn make_terminal_job(id: &str) -> Job {
        let mut job = Job::new(id, "s1", vec![], InterpreterTag::Python, ResourceLimits::default(), None);
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Done).unwrap();
        job
    }

    #[tokio::test]
    async fn purge_expired_removes_only_terminal_jobs_past_retention() {
        let store = JobStore::new(Duration::from_millis(50));
        store.insert(make_terminal_job("done-1")).await;

        let mut running = Job::new("running-1", "s1", vec![], InterpreterTag::Python, ResourceLimits::default(), None);
        running.transition(JobState::Running).unwrap();
        store.insert(running).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        store.purge_expired().await;

        assert_eq!(store.state("done-1").await, None);
        assert_eq!(store.state("running-1").await, Some(JobState::Running));
    }

    #[tokio::test]
    async fn purge_expired_keeps_recent_terminal_jobs() {
        let store = JobStore::new(Duration::from_secs(60));
        store.insert(make_terminal_job("done-1")).await;
        store.purge_expired().await;
        assert_eq!(store.state("done-1").await, Some(JobState::Done));
    }

    #[tokio::test]
    async fn take_removes_the_job_on_retrieval() {
        let store = JobStore::new(Duration::from_secs(60));
        store.insert(make_terminal_job("done-1")).await;

        let taken = store.take("done-1").await;
        assert!(taken.is_some());
        assert_eq!(store.state("done-1").await, None);
        assert!(store.take("done-1").await.is_none());
    }
}
