use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "vmplan",
    about = "vmplan — VM migration planner for hypervisor clusters",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan migrations off one source host.
    ///
    /// The request is read from a JSON file; individual flags override
    /// its source host and exclusions. With no selection criterion every
    /// running VM on the source is placed.
    Plan {
        /// Cluster snapshot (JSON)
        #[arg(short, long)]
        snapshot: String,
        /// Migration request (JSON)
        #[arg(short, long)]
        request: Option<String>,
        /// Source host, overrides the request file
        #[arg(long)]
        source: Option<String>,
        /// Hosts that must not receive VMs
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
        /// Planner configuration (TOML)
        #[arg(short, long)]
        config: Option<String>,
        /// Known used disk sizes (JSON array of {vm_id, host, used_bytes})
        #[arg(long)]
        disk_usage: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Rebalance the whole cluster.
    Balance {
        /// Cluster snapshot (JSON)
        #[arg(short, long)]
        snapshot: String,
        /// Hosts left out of balancing
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
        /// Planner configuration (TOML)
        #[arg(short, long)]
        config: Option<String>,
        #[arg(long)]
        disk_usage: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print the default planner configuration
    Config {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vmplan=info".parse()?)
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            snapshot,
            request,
            source,
            exclude,
            config,
            disk_usage,
            format,
        } => {
            let inputs = commands::plan::Inputs {
                snapshot: &snapshot,
                config: config.as_deref(),
                disk_usage: disk_usage.as_deref(),
            };
            let mut req = commands::plan::load_request(request.as_deref())?;
            if source.is_some() {
                req.source_host = source;
            }
            req.exclude_hosts.extend(exclude);
            commands::plan::run(&inputs, &req, &format)
        }
        Commands::Balance {
            snapshot,
            exclude,
            config,
            disk_usage,
            format,
        } => {
            let inputs = commands::plan::Inputs {
                snapshot: &snapshot,
                config: config.as_deref(),
                disk_usage: disk_usage.as_deref(),
            };
            commands::plan::balance(&inputs, exclude, &format)
        }
        Commands::Config { output } => commands::config::print_default(output.as_deref()),
    }
}
