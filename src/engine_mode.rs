use stacked_errors::{bail_locationless, Result, StackableErr};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::{download, parse_dockerfile, untar, Command, Container, Engine};

// This side runs in a separate process inside c0, chdired to the target
// container. We may not be chrooted, so nothing here assumes `/` is the root
// of c0; the container is recovered from DOCKER_ROOT instead.

/// The container an engine-mode child is running in, per `DOCKER_ROOT`
/// (default `/`, which is what a chrooted child would see).
pub fn current_container() -> Container {
    let root = match std::env::var("DOCKER_ROOT") {
        Ok(root) if !root.is_empty() => root,
        _ => "/".to_owned(),
    };
    debug!("loading current container, root={root}");
    Container::view("", root)
}

/// Executes one engine-mode op and returns. This is the whole of the `-e`
/// surface: the ops that must logically occur inside a container's
/// filesystem.
pub async fn run_op(args: &[String]) -> Result<()> {
    let this = current_container();
    let eng = Engine::attach(this.clone());
    let (op, op_args) = args
        .split_first()
        .stack_err_locationless("engine mode requires an op")?;
    match op.as_str() {
        "import" => import(op_args).await,
        "start" => start(&this, &eng).await,
        "exec" => exec(op_args).await,
        "info" => {
            println!("Current container = {}", this.root.display());
            Ok(())
        }
        "echo" => {
            println!("{}", op_args.join(" "));
            Ok(())
        }
        "build" => build(&eng).await,
        // reserved names; successful no-ops until they grow semantics
        "serve" | "expose" | "connect" | "prompt" | "commit" => Ok(()),
        other => bail_locationless!("Unknown command: '{other}'"),
    }
}

/// Unpacks an archive from stdin (`-`) or a URL into the current directory,
/// which the dispatcher pointed at the context container.
async fn import(args: &[String]) -> Result<()> {
    let src = args
        .first()
        .stack_err_locationless("import requires a source")?;
    info!("importing from {src}");
    let archive = if src == "-" {
        let mut data = vec![];
        tokio::io::stdin()
            .read_to_end(&mut data)
            .await
            .stack_err("import -> can't read stdin")?;
        data
    } else {
        // a bare host name historically means plain http
        let url = if src.contains("://") {
            src.clone()
        } else {
            format!("http://{src}")
        };
        info!("downloading from {url}");
        download(&url).await?
    };
    // FIXME: print a progress bar
    untar(archive, ".").await
}

/// Fires one `exec <name>` chain per stored command, concurrently, and joins
/// them all. A failed exec is logged, not propagated; `start` is about
/// bringing the container up, not babysitting each command.
async fn start(this: &Container, eng: &Engine) -> Result<()> {
    let commands = crate::container::ls(&this.path(".docker/run/exec")).await?;
    let mut handles = vec![];
    for name in commands {
        let eng = eng.clone();
        handles.push(tokio::task::spawn(async move {
            let res = eng.ctl(&[vec!["exec".to_owned(), name.clone()]]).await;
            (name, res)
        }));
    }
    for handle in handles {
        match handle.await {
            Ok((_, Ok(()))) => (),
            Ok((name, Err(e))) => warn!("start -> exec {name} failed: {e:?}"),
            Err(e) => warn!("start -> exec task panicked: {e:?}"),
        }
    }
    Ok(())
}

/// Executes a process directly, wiring its streams to ours. Chrooting into
/// the container is stubbed out.
async fn exec(args: &[String]) -> Result<()> {
    let (program, rest) = args
        .split_first()
        .stack_err_locationless("exec requires a program")?;
    debug!("EXEC {program} {rest:?}");
    Command::new_os_str(program)
        .args(rest)
        .recording(false)
        .forward(true)
        .forward_line_prefix(Some(String::new()))
        .run_to_completion()
        .await?
        .assert_success()
}

/// Parses `./Dockerfile` and sends the resulting op chain back through the
/// control socket.
async fn build(eng: &Engine) -> Result<()> {
    let dockerfile = tokio::fs::read_to_string("./Dockerfile")
        .await
        .stack_err_locationless("build -> can't open ./Dockerfile")?;
    let chain = parse_dockerfile(&dockerfile)?;
    if chain.is_empty() {
        println!("Empty Dockerfile. Nothing to do.");
        return Ok(());
    }
    println!(
        "Parsed {} operations from Dockerfile. Sending to engine.",
        chain.len()
    );
    eng.ctl(&chain).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserved_ops_succeed_without_side_effects() {
        for op in ["serve", "expose", "connect", "prompt", "commit"] {
            run_op(&[op.to_owned()]).await.unwrap();
        }
        assert!(run_op(&["definitely-not-an-op".to_owned()]).await.is_err());
        assert!(run_op(&[]).await.is_err());
    }

    #[tokio::test]
    async fn echo_and_info_print() {
        // these only exercise that the ops resolve and return success; their
        // stdout is observed in the end-to-end scenarios
        run_op(&["echo".to_owned(), "hello".to_owned(), "world".to_owned()])
            .await
            .unwrap();
        run_op(&["info".to_owned()]).await.unwrap();
    }

    #[tokio::test]
    async fn exec_propagates_exit_status() {
        run_op(&["exec".to_owned(), "true".to_owned()]).await.unwrap();
        assert!(
            run_op(&["exec".to_owned(), "false".to_owned()])
                .await
                .is_err()
        );
    }
}
