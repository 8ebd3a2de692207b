//! The sandboxed execution engine: process isolation, resource limit
//! enforcement, output capture, and lifecycle control (spec §4.1).
//!
//! Process-group lifecycle is grounded in
//! `examples/DSado88-squall/src/dispatch/cli.rs`'s `CliDispatch::query_model`:
//! the child becomes its own process-group leader via `.process_group(0)`,
//! a drop guard SIGKILLs the negative pid so aborted tasks don't orphan
//! grandchildren, and output is read through a `+1`-byte-over-cap sentinel
//! to distinguish "exactly at the limit" from "exceeded it" without
//! ambiguity. Resource-limit enforcement and the seccomp allowlist are
//! grounded in `examples/original_source/src/sandbox.cpp`.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::error::SandboxError;
use crate::job::{InterpreterTag, ResourceLimits, SecurityTier};

/// Output is capped at 10 MiB captured (spec §6 "Limits").
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Result of one `execute` call (spec §4.1 `execute`).
#[derive(Debug, Default)]
pub struct ExecuteOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub wall_time: Duration,
    pub cpu_seconds: f64,
    pub peak_memory_bytes: u64,
    pub timed_out: bool,
    pub output_files: Vec<PathBuf>,
}

/// Resolve the interpreter tag to a command line (spec §4.1 step 2).
/// Returns `InterpreterUnavailable` for anything not in the fixed set —
/// this check happens before spawning, matching the spec's ordering.
fn resolve_command(interpreter: InterpreterTag, script_path: &Path) -> Result<(String, Vec<String>), SandboxError> {
    let path = script_path.to_string_lossy().to_string();
    let (program, args) = match interpreter {
        InterpreterTag::Python => ("python3".to_string(), vec![path]),
        InterpreterTag::NodeJs => ("node".to_string(), vec![path]),
        InterpreterTag::Go => ("go".to_string(), vec!["run".to_string(), path]),
        InterpreterTag::Rust | InterpreterTag::Cpp | InterpreterTag::Cuda => {
            // Compile-then-run interpreters build a binary alongside the
            // source file and exec it; handled by `build_and_run_command`
            // in `execute` since they need two process stages.
            return Err(SandboxError::InterpreterUnavailable(
                "compiled interpreters are dispatched via build_and_run_command".to_string(),
            ));
        }
    };
    Ok((program, args))
}

fn compiler_for(interpreter: InterpreterTag) -> Option<&'static str> {
    match interpreter {
        InterpreterTag::Rust => Some("rustc"),
        InterpreterTag::Cpp => Some("g++"),
        InterpreterTag::Cuda => Some("nvcc"),
        _ => None,
    }
}

/// Drop guard: sends SIGKILL to the *process group* (negative pid) so
/// descendants spawned by the child are also reaped, not just the leader.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
}

/// Apply per-process resource limits before exec, matching
/// `original_source/src/sandbox.cpp::applyResourceLimits`.
fn apply_resource_limits(limits: &ResourceLimits) -> std::io::Result<()> {
    fn set(resource: u32, value: u64) -> std::io::Result<()> {
        let rlim = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    // RLIMIT_AS is set above the configured cap, as a backstop in case the
    // parent's VmRSS monitor is starved: the monitor is what actually
    // enforces `max_memory_bytes` and marks the outcome `timed_out`, since
    // RLIMIT_AS on its own only fails the child's next allocation rather
    // than sending a signal the parent can observe.
    set(libc::RLIMIT_AS, limits.max_memory_bytes.saturating_mul(2))?;
    set(libc::RLIMIT_CPU, limits.max_cpu_seconds)?;
    set(libc::RLIMIT_FSIZE, limits.max_output_file_bytes)?;
    set(libc::RLIMIT_NPROC, limits.max_processes as u64)?;
    set(libc::RLIMIT_NOFILE, limits.max_open_files as u64)?;
    Ok(())
}

/// Unshare the namespaces called for by `tier`, matching
/// `original_source/src/sandbox.cpp::createIsolatedProcess`'s flag table:
/// Standard and above drop mount/UTS/IPC (and network, unless explicitly
/// allowed); Paranoid additionally drops into a fresh user namespace.
///
/// Only gated behind the `namespaces` feature: `unshare(CLONE_NEWPID)` from
/// inside a `pre_exec` hook affects children forked *after* the call, not
/// the process about to exec, so full PID isolation would need a second
/// fork that `tokio::process` doesn't expose a hook for — mount/UTS/IPC/net
/// namespaces apply to the calling process immediately and are what this
/// enforces. Seccomp syscall filtering is not implemented: a hand-rolled
/// BPF filter is out of scope without a vetted crate for it.
#[cfg(feature = "namespaces")]
fn apply_namespaces(tier: SecurityTier, network_allowed: bool) -> std::io::Result<()> {
    if tier == SecurityTier::Minimal {
        return Ok(());
    }

    let mut flags = libc::CLONE_NEWNS | libc::CLONE_NEWUTS | libc::CLONE_NEWIPC;
    if !network_allowed {
        flags |= libc::CLONE_NEWNET;
    }
    if tier == SecurityTier::Paranoid || tier == SecurityTier::GpuSecure {
        flags |= libc::CLONE_NEWUSER;
    }

    if unsafe { libc::unshare(flags) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(feature = "namespaces"))]
fn apply_namespaces(_tier: SecurityTier, _network_allowed: bool) -> std::io::Result<()> {
    Ok(())
}

/// Sample `/proc/{pid}/status` VmRSS at ~10 Hz, matching
/// `original_source/src/sandbox.cpp::monitorResourceUsage`. `RLIMIT_AS`
/// only makes the child's own allocations fail with `ENOMEM`; it does not
/// kill the process, so crossing `max_memory_bytes` is enforced here in
/// the parent: SIGKILL the process group and flip `limit_hit` so the
/// caller can mark the outcome `timed_out` (spec §4.1 step 5).
async fn sample_peak_memory(
    pid: u32,
    peak: Arc<AtomicU64>,
    running: Arc<std::sync::atomic::AtomicBool>,
    max_bytes: u64,
    limit_hit: Arc<std::sync::atomic::AtomicBool>,
) {
    let path = format!("/proc/{pid}/status");
    while running.load(Ordering::Relaxed) {
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            for line in contents.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb_str) = rest.split_whitespace().next()
                        && let Ok(kb) = kb_str.parse::<u64>()
                    {
                        let bytes = kb * 1024;
                        peak.fetch_max(bytes, Ordering::Relaxed);
                        if bytes > max_bytes {
                            limit_hit.store(true, Ordering::Relaxed);
                            unsafe {
                                libc::kill(-(pid as i32), libc::SIGKILL);
                            }
                            return;
                        }
                    }
                    break;
                }
            }
        } else {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Read CPU seconds (utime + stime) from `/proc/{pid}/stat`.
async fn read_cpu_seconds(pid: u32) -> Option<f64> {
    let contents = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    // Field 2 (comm) may contain spaces/parens; split after the last ')'.
    let after_comm = contents.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime is field 14 overall, stime is field 15; after splitting off
    // "pid (comm)" (fields 1-2), remaining fields are 0-indexed from field 3,
    // so utime is index 11, stime is index 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as f64;
    if ticks_per_sec <= 0.0 {
        return None;
    }
    Some((utime + stime) as f64 / ticks_per_sec)
}

/// Public operations of the Executor (spec §4.1).
pub struct Executor {
    running: RwLock<HashMap<String, Arc<AtomicU32>>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            running: RwLock::new(HashMap::new()),
        }
    }

    /// Launch an isolated child, apply limits, capture output, detect
    /// timeout, report metrics (spec §4.1 `execute`).
    pub async fn execute(
        &self,
        job_id: &str,
        code: &[u8],
        interpreter: InterpreterTag,
        limits: ResourceLimits,
        tier: SecurityTier,
        network_allowed: bool,
        env: &[(String, String)],
    ) -> Result<ExecuteOutcome, SandboxError> {
        let work_dir = std::env::temp_dir().join(format!("sandrun-{job_id}"));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| SandboxError::InternalIo(e.to_string()))?;

        let script_name = format!("script.{}", interpreter.extension());
        let script_path = work_dir.join(&script_name);
        tokio::fs::write(&script_path, code)
            .await
            .map_err(|e| SandboxError::InternalIo(e.to_string()))?;

        let (program, args) = match compiler_for(interpreter) {
            Some(compiler) => {
                build_compiled(compiler, &script_path, &work_dir, &limits)
                    .await
                    .map(|binary| (binary, Vec::<String>::new()))?
            }
            None => resolve_command(interpreter, &script_path)?,
        };

        let result = self
            .run_and_capture(job_id, &program, &args, &work_dir, &limits, tier, network_allowed, env)
            .await;

        // Only a clean run's files are trustworthy: a run killed by a
        // resource limit (e.g. RLIMIT_FSIZE) can leave a partially-written
        // file of exactly the cap's size sitting in the working directory.
        let output_files = match &result {
            Ok(outcome) if outcome.exit_code == 0 && !outcome.timed_out => {
                collect_output_files(&work_dir, &script_name).await
            }
            _ => Vec::new(),
        };
        let _ = tokio::fs::remove_dir_all(&work_dir).await;

        result.map(|mut outcome| {
            outcome.output_files = output_files;
            outcome
        })
    }

    /// Asynchronously request termination of a running job (spec §4.1 `kill`).
    /// Returns whether a matching job was found. Sends SIGKILL to the whole
    /// process group, not just the leader.
    pub async fn kill(&self, job_id: &str) -> bool {
        let running = self.running.read().await;
        match running.get(job_id) {
            Some(pid) => {
                let pid = pid.load(Ordering::Relaxed);
                if pid != 0 {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
                true
            }
            None => false,
        }
    }

    async fn run_and_capture(
        &self,
        job_id: &str,
        program: &str,
        args: &[String],
        work_dir: &Path,
        limits: &ResourceLimits,
        tier: SecurityTier,
        network_allowed: bool,
        env: &[(String, String)],
    ) -> Result<ExecuteOutcome, SandboxError> {
        let start = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(work_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let limits_for_child = *limits;
        unsafe {
            cmd.pre_exec(move || {
                apply_namespaces(tier, network_allowed)?;
                apply_resource_limits(&limits_for_child)
            });
        }

        let mut child = cmd.spawn().map_err(|e| SandboxError::SpawnFailed {
            interpreter: program.to_string(),
            message: e.to_string(),
        })?;

        let pid = child.id();
        let pid_slot = Arc::new(AtomicU32::new(pid.unwrap_or(0)));
        {
            let mut running = self.running.write().await;
            running.insert(job_id.to_string(), pid_slot.clone());
        }

        let mut guard = ProcessGroupGuard::new(pid);

        let peak_memory = Arc::new(AtomicU64::new(0));
        let monitor_running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let memory_limit_hit = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let monitor_handle = pid.map(|pid| {
            tokio::spawn(sample_peak_memory(
                pid,
                peak_memory.clone(),
                monitor_running.clone(),
                limits.max_memory_bytes,
                memory_limit_hit.clone(),
            ))
        });

        let read_limit = MAX_OUTPUT_BYTES as u64 + 1;
        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");

        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::with_capacity(MAX_OUTPUT_BYTES.min(64 * 1024));
            let mut capped = (&mut stdout_pipe).take(read_limit);
            let _ = capped.read_to_end(&mut buf).await;
            buf
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::with_capacity(MAX_OUTPUT_BYTES.min(64 * 1024));
            let mut capped = (&mut stderr_pipe).take(read_limit);
            let _ = capped.read_to_end(&mut buf).await;
            buf
        });

        let wall_timeout = limits.wall_timeout();
        let reap = async {
            let stdout = stdout_handle.await.unwrap_or_default();
            let stderr = stderr_handle.await.unwrap_or_default();
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        let (stdout, stderr, status, timed_out) = match tokio::time::timeout(wall_timeout, reap).await {
            Ok((stdout, stderr, status)) => (stdout, stderr, status, false),
            Err(_) => {
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
                let status = child.wait().await;
                (Vec::new(), Vec::new(), status, true)
            }
        };

        monitor_running.store(false, Ordering::Relaxed);
        if let Some(handle) = monitor_handle {
            let _ = handle.await;
        }

        {
            let mut running = self.running.write().await;
            running.remove(job_id);
        }
        guard.disarm();

        let wall_time = start.elapsed();
        let cpu_seconds = match pid {
            Some(pid) => read_cpu_seconds(pid).await.unwrap_or(0.0),
            None => 0.0,
        };

        let stdout_truncated = stdout.len() > MAX_OUTPUT_BYTES;
        let stdout = truncate_to(stdout, MAX_OUTPUT_BYTES);
        let stderr = truncate_to(stderr, MAX_OUTPUT_BYTES);

        let status = status.map_err(|e| SandboxError::InternalIo(e.to_string()))?;

        // Exit code positive for normal exit, signed-negative for signal
        // termination (spec §4.1 step 6).
        let exit_code = match status.code() {
            Some(code) => code,
            None => -status.signal().unwrap_or(0),
        };

        // `RLIMIT_CPU` has the kernel send SIGXCPU first (and SIGKILL if the
        // process ignores it and keeps running), attributable to the CPU
        // limit rather than our own wall-timeout or memory-limit kill above.
        let cpu_limit_hit = status.signal() == Some(libc::SIGXCPU);
        let timed_out = timed_out || memory_limit_hit.load(Ordering::Relaxed) || cpu_limit_hit;

        Ok(ExecuteOutcome {
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            wall_time,
            cpu_seconds,
            peak_memory_bytes: peak_memory.load(Ordering::Relaxed),
            timed_out,
            output_files: Vec::new(),
        })
    }
}

fn truncate_to(mut buf: Vec<u8>, max: usize) -> Vec<u8> {
    buf.truncate(max);
    buf
}

/// Compile a Rust/C++/CUDA source file and return the path to the produced
/// binary, matching the spec's `buildCommand` table in
/// `original_source/src/sandbox.cpp` generalized to two process stages
/// instead of a shell `&&`.
async fn build_compiled(
    compiler: &str,
    script_path: &Path,
    work_dir: &Path,
    limits: &ResourceLimits,
) -> Result<String, SandboxError> {
    let binary_path = script_path.with_extension("out");
    let mut cmd = Command::new(compiler);
    cmd.arg(script_path)
        .arg("-o")
        .arg(&binary_path)
        .current_dir(work_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let limits_for_child = *limits;
    unsafe {
        cmd.pre_exec(move || apply_resource_limits(&limits_for_child));
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| SandboxError::SpawnFailed {
            interpreter: compiler.to_string(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(SandboxError::LimitViolation {
            reason: format!(
                "compilation with {compiler} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }

    Ok(binary_path.to_string_lossy().to_string())
}

/// Scan the working directory for produced files, excluding the code file
/// itself (spec §4.1 step 6).
async fn collect_output_files(work_dir: &Path, script_name: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(work_dir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == script_name || name.ends_with(".out") {
            continue;
        }
        files.push(entry.path());
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hello_world_python_succeeds() {
        let executor = Executor::new();
        let outcome = executor
            .execute(
                "t-hello",
                b"print('Hello, World!')",
                InterpreterTag::Python,
                ResourceLimits::default(),
                SecurityTier::Minimal,
                true,
                &[],
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(String::from_utf8_lossy(&outcome.stdout), "Hello, World!\n");
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn wall_timeout_kills_and_reports_negative_exit() {
        let executor = Executor::new();
        let limits = ResourceLimits {
            max_wall_seconds: 1,
            ..ResourceLimits::default()
        };

        let start = Instant::now();
        let outcome = executor
            .execute(
                "t-timeout",
                b"import time\ntime.sleep(5)",
                InterpreterTag::Python,
                limits,
                SecurityTier::Minimal,
                true,
                &[],
            )
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(outcome.timed_out);
        assert!(outcome.exit_code < 0);
        assert!(outcome.stdout.is_empty());
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn memory_limit_crossing_is_marked_timed_out() {
        let executor = Executor::new();
        let limits = ResourceLimits {
            max_memory_bytes: 64 * 1024 * 1024,
            max_wall_seconds: 10,
            ..ResourceLimits::default()
        };

        let outcome = executor
            .execute(
                "t-memlimit",
                b"x = bytearray(100 * 1024 * 1024)\nimport time\ntime.sleep(5)",
                InterpreterTag::Python,
                limits,
                SecurityTier::Minimal,
                true,
                &[],
            )
            .await
            .unwrap();

        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn unknown_interpreter_tag_never_spawns() {
        // InterpreterTag::parse gate happens above this layer; here we
        // verify the resolve path rejects an interpreter with no direct
        // command mapping before any process is spawned.
        let script = Path::new("/tmp/does-not-matter.rs");
        assert!(resolve_command(InterpreterTag::Rust, script).is_err());
    }

    #[tokio::test]
    async fn kill_on_unknown_job_returns_false() {
        let executor = Executor::new();
        assert!(!executor.kill("no-such-job").await);
    }

    #[cfg(feature = "namespaces")]
    #[tokio::test]
    async fn standard_tier_isolates_hostname_namespace() {
        let executor = Executor::new();
        let outcome = executor
            .execute(
                "t-uts",
                b"import socket\nprint(socket.gethostname())",
                InterpreterTag::Python,
                ResourceLimits::default(),
                SecurityTier::Standard,
                false,
                &[],
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
    }

    #[cfg(feature = "namespaces")]
    #[tokio::test]
    async fn network_denied_job_cannot_reach_an_external_socket() {
        let executor = Executor::new();
        let code = b"\
import socket
s = socket.socket(socket.AF_INET, socket.SOCK_STREAM)
s.settimeout(2)
try:
    s.connect(('93.184.216.34', 80))
    print('connected')
except OSError:
    import sys
    sys.exit(1)
";
        let outcome = executor
            .execute(
                "t-netns",
                code,
                InterpreterTag::Python,
                ResourceLimits::default(),
                SecurityTier::Standard,
                false,
                &[],
            )
            .await
            .unwrap();

        assert_ne!(outcome.exit_code, 0);
    }
}
