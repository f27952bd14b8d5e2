use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskgrid::clock::SystemClock;
use taskgrid::config::NodeConfig;
use taskgrid::error::{GridError, Result};
use taskgrid::executor::ExecutorAgent;
use taskgrid::mesh::LocalMesh;
use taskgrid::model::{Job, Task};
use taskgrid::node::{Node, Roles};
use taskgrid::shutdown::install_shutdown_handler;
use taskgrid::store::MemStore;
use taskgrid::worker::ready_line;

#[derive(Parser, Debug)]
#[command(name = "taskgrid")]
#[command(version)]
#[command(about = "A distributed DAG task scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a taskgrid node serving the selected roles
    Server(ServerArgs),

    /// Submit a job specification file
    Submit {
        /// Path to the job JSON file
        file: PathBuf,
    },

    /// Update one job, or sweep every submitted job when no id is given
    Update {
        /// The job id
        job_id: Option<String>,
    },

    /// Sweep every submitted job once
    Check,

    /// Kill every running executor of a job
    Kill {
        /// The job id
        job_id: String,
    },

    /// Supervise one task (spawned per task by a forking worker)
    #[command(hide = true)]
    Execute {
        task_id: String,
        task_json: String,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Serve the scheduler capability
    #[arg(long)]
    scheduler: bool,

    /// React to store events with debounced checks
    #[arg(long)]
    watcher: bool,

    /// Advertise capacity and accept task dispatches
    #[arg(long)]
    worker: bool,

    /// Shorthand for --scheduler --watcher --worker
    #[arg(long)]
    all: bool,

    /// Node id (random hex-8 if omitted)
    #[arg(long)]
    node_id: Option<String>,

    /// Worker tags, comma separated (the implicit "any" tag is always added)
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Fork one `taskgrid execute` process per task instead of running
    /// executors in-process. Requires a store backend shared across
    /// processes.
    #[arg(long)]
    fork: bool,

    /// Submit this job file once the node is up
    #[arg(long)]
    job: Option<PathBuf>,

    /// Heartbeat lease TTL in seconds
    #[arg(long, default_value = "10")]
    lease_ttl: u64,

    /// Poll interval in seconds
    #[arg(long, default_value = "5")]
    poll_interval: u64,
}

fn load_job(path: &Path) -> Result<Job> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn build_node(config: NodeConfig) -> Node {
    let clock = Arc::new(SystemClock);
    let store = MemStore::new(clock.clone());
    let mesh = LocalMesh::new();
    Node::new(config, store, mesh, clock)
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let roles = Roles {
        scheduler: args.scheduler || args.all,
        watcher: args.watcher || args.all,
        worker: args.worker || args.all,
    };

    let mut config = match args.node_id {
        Some(id) => NodeConfig::new(id),
        None => NodeConfig::default(),
    };
    config = config
        .with_lease_ttl(Duration::from_secs(args.lease_ttl))
        .with_poll_interval(Duration::from_secs(args.poll_interval))
        .with_tags(args.tags);

    let node = build_node(config);
    let token = install_shutdown_handler();

    if let Some(path) = &args.job {
        let job = load_job(path)?;
        let id = node.scheduler.submit(job).await?;
        println!("{id}");
    }

    node.run(roles, args.fork, token).await
}

async fn run_execute(task_id: String, task_json: String) -> Result<i32> {
    let task: Task = serde_json::from_str(&task_json)?;
    let clock = Arc::new(SystemClock);
    let store = MemStore::new(clock.clone());

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let agent = ExecutorAgent::new(
        store,
        clock,
        NodeConfig::new(task_id.clone()),
        task,
        Some(ready_tx),
    )
    .await?;

    let runner = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run().await }
    });

    // The readiness line on stdout is the acknowledgment the forking worker
    // waits for; logs go to stderr.
    if ready_rx.await.is_ok() {
        println!("{}", ready_line(&task_id));
    }

    match runner.await {
        Ok(result) => result,
        Err(e) => Err(GridError::Io(std::io::Error::other(e))),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let outcome: Result<()> = match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Submit { file } => {
            let node = build_node(NodeConfig::default());
            match load_job(&file) {
                Ok(job) => node.scheduler.submit(job).await.map(|id| println!("{id}")),
                Err(e) => Err(e),
            }
        }
        Commands::Update { job_id } => {
            let node = build_node(NodeConfig::default());
            match job_id {
                Some(id) => node.scheduler.update(&id).await,
                None => node.scheduler.check().await,
            }
        }
        Commands::Check => {
            let node = build_node(NodeConfig::default());
            node.scheduler.check().await
        }
        Commands::Kill { job_id } => {
            let node = build_node(NodeConfig::default());
            node.scheduler.kill(&job_id).await
        }
        Commands::Execute { task_id, task_json } => match run_execute(task_id, task_json).await {
            Ok(code) => std::process::exit(code),
            Err(e) => Err(e),
        },
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
