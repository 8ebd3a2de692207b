use std::sync::Arc;

use sandrun::config::Config;
use sandrun::job::{InterpreterTag, Job, JobState, JobStore, SecurityTier};
use sandrun::proof::{Session, Verbosity};
use sandrun::rate_limiter::{LimitKind, RateEngine};
use sandrun::sandbox::Executor;
use sandrun::worker_identity::WorkerIdentity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    tracing::info!("sandrun starting");

    let config = Config::from_env();
    let identity = match &config.worker_key_path {
        Some(path) => load_or_generate_identity(path).await?,
        None => WorkerIdentity::generate(),
    };
    tracing::info!(worker_id = %identity.worker_id(), "node identity ready");

    let rate_engine = Arc::new(RateEngine::new());
    let executor = Arc::new(Executor::new());
    let job_store = JobStore::default();

    let mut args = std::env::args().skip(1);
    let script_path = match args.next() {
        Some(path) => path,
        None => {
            tracing::error!("usage: sandrun <script-path> <interpreter-tag> [subject-id]");
            anyhow::bail!("missing script path argument");
        }
    };
    let interpreter_tag = args.next().unwrap_or_else(|| "python".to_string());
    let subject = args.next().unwrap_or_else(|| "local".to_string());
    let deterministic = args.next().as_deref() == Some("--deterministic");

    let interpreter = InterpreterTag::parse(&interpreter_tag)
        .ok_or_else(|| anyhow::anyhow!("unknown interpreter tag: {interpreter_tag}"))?;
    let code = tokio::fs::read(&script_path).await?;

    rate_engine
        .acquire(&subject, LimitKind::ConcurrentJobs, 1)
        .await?;

    let job_id = format!("job-{}", identity.worker_id().chars().take(8).collect::<String>());
    let mut job = Job::new(
        &job_id,
        &subject,
        code.clone(),
        interpreter,
        config.default_limits,
        None,
    );

    let mut session = Session::start(&job_id, &code, Verbosity::Standard);
    if deterministic {
        session.enable_deterministic_mode();
    }
    session.record_step("job.queued", std::slice::from_ref(&subject), "ok")?;

    job.transition(JobState::Running).expect("queued job always admits running");

    let env = if deterministic {
        sandrun::proof::deterministic_env()
    } else {
        Vec::new()
    };
    let outcome = executor
        .execute(
            &job_id,
            &code,
            interpreter,
            config.default_limits,
            SecurityTier::Minimal,
            false,
            &env,
        )
        .await;

    rate_engine
        .release(&subject, LimitKind::ConcurrentJobs, 1)
        .await;

    let outcome = outcome?;
    job.transition(if outcome.timed_out {
        JobState::Killed
    } else if outcome.exit_code == 0 {
        JobState::Done
    } else {
        JobState::Failed
    })
    .expect("running job always admits a terminal state");
    job_store.insert(job).await;

    session.record_step(
        "job.finished",
        &[outcome.exit_code.to_string()],
        if outcome.timed_out { "timeout" } else { "exited" },
    )?;

    let proof = session.generate_proof(&identity, format!("subject={subject}"))?;
    tracing::info!(
        job_id = %job_id,
        exit_code = outcome.exit_code,
        cpu_seconds = outcome.cpu_seconds,
        peak_memory_bytes = outcome.peak_memory_bytes,
        final_hash = %proof.final_hash,
        "job complete"
    );

    // Retrieving the result auto-deletes it (spec §3: retention "unless
    // retrieved"); a background sweep would otherwise purge it after
    // `DEFAULT_RETENTION`.
    let retrieved = job_store.take(&job_id).await;
    debug_assert!(retrieved.is_some());

    std::io::Write::write_all(&mut std::io::stdout(), &outcome.stdout)?;
    std::io::Write::write_all(&mut std::io::stderr(), &outcome.stderr)?;

    tracing::info!("sandrun shutting down");
    std::process::exit(outcome.exit_code.clamp(0, 255));
}

async fn load_or_generate_identity(path: &str) -> anyhow::Result<WorkerIdentity> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.len() == 32 => {
            let seed: [u8; 32] = bytes.try_into().expect("checked length");
            Ok(WorkerIdentity::from_seed(&seed))
        }
        _ => {
            tracing::warn!("worker keyfile {path} unreadable or malformed, generating a fresh identity");
            Ok(WorkerIdentity::generate())
        }
    }
}
