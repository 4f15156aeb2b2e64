use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lessor")]
#[command(author, version, about = "Lease-based coordination for agents sharing a workspace", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Debug logging (also LESSOR_VERBOSE)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Exactly one of `--task` / `--file`.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct ResourceArg {
    /// Task id
    #[arg(long)]
    pub task: Option<String>,

    /// File path
    #[arg(long)]
    pub file: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a READY task
    Enqueue {
        /// Task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        #[arg(long, default_value_t = 0)]
        priority: i64,

        /// JSON payload
        #[arg(long)]
        payload: Option<String>,

        #[arg(long)]
        policy: Option<String>,
    },

    /// Lease the highest-priority READY task
    Reserve {
        #[arg(long)]
        agent: String,

        /// Lease length in milliseconds (default: LESSOR_DEFAULT_TTL_MS)
        #[arg(long)]
        ttl_ms: Option<i64>,
    },

    /// Extend a live lease held by the agent
    Renew {
        #[command(flatten)]
        resource: ResourceArg,

        #[arg(long)]
        agent: String,

        #[arg(long)]
        ttl_ms: i64,
    },

    /// Release a lease held by the agent
    Release {
        #[command(flatten)]
        resource: ResourceArg,

        #[arg(long)]
        agent: String,
    },

    /// Reserve a file for editing
    AcquireFile {
        path: String,

        #[arg(long)]
        agent: String,

        #[arg(long, default_value_t = 300_000)]
        ttl_ms: i64,

        #[arg(long)]
        reason: Option<String>,

        /// Take over a foreign reservation (needs LESSOR_ALLOW_OVERRIDE)
        #[arg(long)]
        r#override: bool,
    },

    /// Release a file reservation
    ReleaseFile {
        path: String,

        #[arg(long)]
        agent: String,
    },

    /// Pre-flight conflict check for files about to be edited
    Check {
        #[arg(required = true)]
        paths: Vec<String>,

        #[arg(long)]
        agent: String,
    },

    /// Record liveness, optionally renewing a task lease
    Heartbeat {
        #[arg(long)]
        agent: String,

        #[arg(long)]
        task: Option<String>,

        #[arg(long, requires = "task")]
        ttl_ms: Option<i64>,

        #[arg(long)]
        phase: Option<String>,

        /// Agent is in the middle of a write or commit
        #[arg(long)]
        busy: bool,
    },

    /// Expire leases, prune stale heartbeats and old events
    Refresh,

    /// Reclaim leases expired now
    Expire,

    /// Park a protocol message (JSON) in the queue
    Send { message: String },

    /// Dispatch queued messages
    Drain {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Show the event log
    Events {
        /// Only events of this resource
        #[arg(long)]
        resource: Option<String>,

        /// Only events of this kind (e.g. CLAIMED)
        #[arg(long)]
        kind: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Runtime snapshot
    Status,
}
