use clap::Parser;
use stacked_errors::{bail, Result, StackableErr};
use stevedore::{Container, Engine, HookRegistry};
use tokio::sync::oneshot;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Experimental container build/run engine. With no flags, bootstraps a root
/// container in the current directory, starts the engine, and sends the
/// given op chain to it. With `-e`, executes a single engine-mode op inside
/// the current container (per `DOCKER_ROOT`) and exits.
#[derive(Debug, Parser)]
#[command(name = "stevedore")]
struct Args {
    /// Engine mode
    #[arg(short = 'e', long = "engine")]
    engine_mode: bool,
    /// Execute a new operation in the chain (repeatable; whitespace-split)
    #[arg(short = 'c', value_name = "OP")]
    chain: Vec<String>,
    /// The op and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    op: Vec<String>,
}

fn init_tracing() {
    // `DEBUG` keeps its historical meaning of "trace everything to stderr"
    let debug_set = std::env::var("DEBUG").map(|v| !v.is_empty()).unwrap_or(false);
    let default = if debug_set { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    if args.engine_mode {
        return stevedore::engine_mode::run_op(&args.op)
            .await
            .stack_err_with(|| {
                format!("Failed to execute engine command '{}'", args.op.join(" "))
            });
    }
    host_main(args).await
}

async fn host_main(args: Args) -> Result<()> {
    let mut ops: Vec<Vec<String>> = args
        .chain
        .iter()
        .map(|op| op.split_whitespace().map(str::to_owned).collect())
        .collect();
    if ops.is_empty() {
        if args.op.is_empty() {
            bail!("Usage: stevedore CMD [ARGS...]")
        }
        ops.push(args.op.clone());
    } else if !args.op.is_empty() {
        bail!("Usage: stevedore CMD [ARGS...]")
    }
    let c0 = Container::create("0", ".")
        .await
        .stack_err("Failed to set up root container")?;
    let hooks = HookRegistry::load_all(c0.path(".docker/hooks"))
        .stack_err("Failed to load hooks")?;
    let eng = Engine::new(c0, hooks)
        .await
        .stack_err("Failed to initialize engine")?;
    let (ready_tx, ready_rx) = oneshot::channel();
    let server = eng.clone();
    let server_task = tokio::task::spawn(async move {
        if let Err(e) = server.listen_and_serve(ready_tx).await {
            error!("engine failed: {e:?}");
        }
    });
    ready_rx
        .await
        .stack_err("Engine never became ready")?;
    // die is the conventional final op of a chain
    ops.push(vec!["die".to_owned()]);
    let res = eng
        .ctl(&ops)
        .await
        .stack_err("Error sending engine startup commands");
    eng.cleanup().await;
    server_task.abort();
    res
}
