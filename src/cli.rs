use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "slash",
    version,
    about = "Share one proxy process per environment across shells and commands."
)]
pub(crate) struct Cli {
    /// Print debug logs (SLASH_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    pub(crate) verbose: bool,

    /// Colorize output: auto|always|never
    #[arg(long = "color", value_enum, global = true)]
    pub(crate) color: Option<slash::ColorMode>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Attach a job to the environment's proxy, starting it if needed
    Launch {
        /// Environment name
        env: String,
        /// Job token; defaults to a pid job owned by the parent shell
        #[arg(long)]
        job: Option<String>,
    },

    /// Detach a job; the last job out stops the proxy
    Stop {
        /// Environment name
        env: String,
        /// Job token to detach
        #[arg(long)]
        job: String,
    },

    /// Show running services on this host
    Status {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a command with proxy variables pointing at the environment's proxy
    Run {
        /// Environment name
        #[arg(long, short = 'n', default_value = slash::BASE_ENV)]
        env: String,
        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },

    /// Manage environments
    Env {
        #[command(subcommand)]
        cmd: EnvCmd,
    },

    /// Manage the background reaper
    Reaper {
        #[command(subcommand)]
        cmd: ReaperCmd,
    },

    /// Print version, paths and runtime diagnostics
    Doctor,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum EnvCmd {
    /// List environments
    List,
    /// Create an environment from zero or more subscriptions (URL or local file)
    Create {
        name: String,
        #[arg(long = "sub")]
        subscriptions: Vec<String>,
    },
    /// Remove an environment (refused while its proxy is running)
    Remove { name: String },
    /// Show one environment and its service
    Info { name: String },
    /// Refresh an environment's config from its subscriptions
    Update { name: String },
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum ReaperCmd {
    /// Start the reaper unless one is running
    Start {
        #[arg(long, default_value = "pid")]
        policy: String,
    },
    /// Stop the running reaper
    Stop {
        #[arg(long, default_value = "pid")]
        policy: String,
    },
    /// Show reaper state
    Status {
        #[arg(long, default_value = "pid")]
        policy: String,
    },
    /// Reaper loop entry point used by `reaper start`
    #[command(hide = true)]
    Run {
        #[arg(long)]
        policy: String,
        #[arg(long)]
        owner: u32,
    },
}
