//! Simulation harness: drives a fake data mover against the in-memory
//! store, optionally racing a rival allocation to demonstrate supersession.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::info;

use reflow::checkpoint::ProgressStats;
use reflow::document::JobStateDoc;
use reflow::driver::{run_job, DriverContext, ReindexDriver};
use reflow::job::{JobFailure, JobRequest, Outcome, ReindexResponse};
use reflow::settings::AppConfig;
use reflow::store::MemoryStore;
use reflow::updater::JobStateUpdater;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Number of scroll batches the fake mover processes
    #[arg(long, default_value = "50")]
    steps: i64,

    /// Delay between batches, in milliseconds
    #[arg(long, default_value = "20")]
    step_delay_ms: u64,

    /// Let a rival allocation take the job over mid-run
    #[arg(long)]
    rival: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

struct FakeMover {
    steps: i64,
    step_delay: Duration,
}

#[async_trait]
impl ReindexDriver for FakeMover {
    async fn run(&mut self, ctx: &DriverContext<'_>) -> Outcome {
        let mut stats = ProgressStats::default();
        stats.total = self.steps as u64;
        for position in 1..=self.steps {
            if ctx.is_superseded() {
                return Outcome::failure(JobFailure {
                    error_type: "superseded".to_string(),
                    reason: format!("halted at batch {position}"),
                });
            }
            stats.created += 1;
            stats.batches += 1;
            ctx.checkpoint(position, stats);
            tokio::time::sleep(self.step_delay).await;
        }
        Outcome::Success(ReindexResponse {
            took_ms: self.steps as u64 * self.step_delay.as_millis() as u64,
            stats,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    reflow::trace::init(cfg.log_format)?;

    let store = MemoryStore::new_arc();
    let job_id = "sim-job";
    let request = JobRequest::new(vec!["source-a".to_string(), "source-b".to_string()], "dest");
    store.insert(job_id, &JobStateDoc::new(request, Vec::new()))?;

    if args.rival {
        let rival_store = Arc::clone(&store);
        let rival_settings = cfg.job.clone();
        let delay = Duration::from_millis(args.step_delay_ms * args.steps as u64 / 2);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let rival = JobStateUpdater::new(
                job_id,
                2,
                rival_store as Arc<dyn reflow::store::VersionedStore>,
                rival_settings,
                || info!("rival lost its own assignment"),
            );
            match rival.assign().await {
                Ok(_) => info!("rival claimed allocation 2"),
                Err(e) => info!(error = %e, "rival assign failed"),
            }
        });
    }

    let updater = JobStateUpdater::new(
        job_id,
        1,
        Arc::clone(&store) as Arc<dyn reflow::store::VersionedStore>,
        cfg.job.clone(),
        || info!("allocation lost, driver will halt"),
    );
    let mut mover = FakeMover {
        steps: args.steps,
        step_delay: Duration::from_millis(args.step_delay_ms),
    };

    match run_job(&mut mover, &updater).await {
        Ok(outcome) => info!(success = outcome.is_success(), "run completed"),
        Err(e) => info!(error = %e, "run aborted"),
    }

    let doc = store.snapshot(job_id).expect("job document");
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
