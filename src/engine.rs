use std::path::PathBuf;

use stacked_errors::{bail_locationless, Error, Result, StackableErr};
use tokio::{
    io::BufReader,
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixListener, UnixStream,
    },
    select,
    signal::unix::{signal, SignalKind},
    sync::oneshot,
};
use tracing::{debug, info};

use crate::{
    clean_logical, container_path, copy_with_tar, generate_id, new_env, wire, Cmd, Container,
    HookMode, HookRegistry,
};

/// The control-plane daemon: owns the root container and dispatches the
/// operations arriving on the control socket. Cheap to clone; all real state
/// is on disk.
#[derive(Debug, Clone)]
pub struct Engine {
    c0: Container,
    hooks: HookRegistry,
}

impl Engine {
    /// Initializes engine state on the root container: the engine id and the
    /// `containers/0` self-reference.
    pub async fn new(c0: Container, hooks: HookRegistry) -> Result<Self> {
        crate::container::write_file(
            &c0.path(".docker/engine/id"),
            &format!("{}\n", generate_id()),
        )
        .await?;
        crate::atomic_symlink("../../..", c0.path(".docker/engine/containers/0")).await?;
        Ok(Self { c0, hooks })
    }

    /// An engine handle over already-initialized state (what engine-mode
    /// children use; they never fire hooks themselves).
    pub fn attach(c0: Container) -> Self {
        Self {
            c0,
            hooks: HookRegistry::default(),
        }
    }

    /// The root container this engine serves
    pub fn root(&self) -> &Container {
        &self.c0
    }

    /// `<c0 root>/.docker/engine/<p>`
    pub fn path(&self, p: &str) -> PathBuf {
        self.c0.path(&format!(".docker/engine/{p}"))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.path("ctl")
    }

    /// Removes the control socket
    pub async fn cleanup(&self) {
        debug!("cleaning up engine");
        let _ = tokio::fs::remove_file(self.socket_path()).await;
    }

    /// Binds the control socket and serves sessions until an interrupt or
    /// terminate signal closes the listener. `ready` fires after the socket
    /// is bound so the initial in-process client can dial without racing.
    ///
    /// A leftover socket from a dead engine is cleaned up and rebound; a
    /// socket something still answers on aborts the bind.
    pub async fn listen_and_serve(self, ready: oneshot::Sender<()>) -> Result<()> {
        let socket = self.socket_path();
        let listener = match UnixListener::bind(&socket) {
            Ok(listener) => listener,
            Err(bind_err) => match UnixStream::connect(&socket).await {
                Ok(_) => {
                    return Err(bind_err).stack_err_with(|| {
                        format!("an engine is already listening on {socket:?}")
                    })
                }
                Err(_) => {
                    debug!("cleaning up leftover unix socket");
                    let _ = tokio::fs::remove_file(&socket).await;
                    UnixListener::bind(&socket)
                        .stack_err_with(|| format!("can't bind {socket:?}"))?
                }
            },
        };
        debug!("setting up signals");
        let mut interrupt =
            signal(SignalKind::interrupt()).stack_err("can't install interrupt handler")?;
        let mut terminate =
            signal(SignalKind::terminate()).stack_err("can't install terminate handler")?;
        debug!("synchronizing");
        let _ = ready.send(());
        loop {
            debug!("listening on {socket:?}");
            select! {
                accepted = listener.accept() => {
                    let (conn, _) = accepted.stack_err("accept failed")?;
                    debug!("received connection");
                    let engine = self.clone();
                    tokio::task::spawn(async move {
                        match Session::new(engine, conn).await {
                            // session errors were already reported on the wire
                            Ok(session) => drop(session.serve().await),
                            Err(e) => info!("error creating new session: {e:?}"),
                        }
                    });
                }
                _ = interrupt.recv() => {
                    info!("caught interrupt. closing socket");
                    break
                }
                _ = terminate.recv() => {
                    info!("caught terminate. closing socket");
                    break
                }
            }
        }
        drop(listener);
        self.cleanup().await;
        Ok(())
    }

    /// Connects to the engine's control socket and issues a chain of standard
    /// operations on it. This is used to pass user commands to the engine,
    /// and also for further introspection by the containers themselves. A `+`
    /// reply continues the chain, a `-` reply aborts it.
    pub async fn ctl(&self, ops: &[Vec<String>]) -> Result<()> {
        let socket = self.socket_path();
        let stream = UnixStream::connect(&socket)
            .await
            .stack_err_with(|| format!("Engine::ctl -> can't dial {socket:?}"))?;
        let (rd, mut wr) = stream.into_split();
        let mut reader = BufReader::new(rd);
        for (idx, op_args) in ops.iter().enumerate() {
            debug!("sending step #{} ---> {}", idx + 1, op_args.join(" "));
            wire::write_op(&mut wr, op_args).await?;
            debug!("reading response...");
            let (code, text) = wire::read_reply(&mut reader).await?;
            if code == '-' {
                bail_locationless!("Engine error: {text}")
            }
            debug!("engine status: {text}");
        }
        Ok(())
    }
}

/// One accepted control connection: a request stream, a reply stream, and the
/// context the ops range over. The context starts as a freshly allocated
/// scratch container and moves only under `cd`.
pub struct Session {
    engine: Engine,
    root: Container,
    context: Container,
    context_path: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

// the reply side is one line; stacked error reports are flattened onto it
fn one_line(e: &Error) -> String {
    format!("{e}")
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

impl Session {
    pub(crate) async fn new(engine: Engine, conn: UnixStream) -> Result<Self> {
        // create a new empty context for this session
        let context = engine.c0.create_child().await?;
        let (rd, wr) = conn.into_split();
        Ok(Self {
            root: engine.c0.clone(),
            context_path: context.id.clone(),
            context,
            engine,
            reader: BufReader::new(rd),
            writer: wr,
        })
    }

    /// Processes ops strictly in arrival order, one `+OK` per op. Any parse
    /// or dispatch error is reported as a single `-` line and ends the
    /// session; the listener is unaffected.
    pub(crate) async fn serve(mut self) -> Result<()> {
        loop {
            let op = match wire::read_op(&mut self.reader).await {
                Ok(op) => op,
                Err(e) => {
                    let _ = wire::write_reply(&mut self.writer, '-', &one_line(&e)).await;
                    return Err(e);
                }
            };
            if op.name == "die" {
                // die interrupts the session and returns
                let _ = wire::write_reply(&mut self.writer, '+', "OK").await;
                return Ok(());
            }
            if let Err(e) = self.do_op(&op).await {
                let _ = wire::write_reply(&mut self.writer, '-', &one_line(&e)).await;
                return Err(e);
            }
            debug!("sending OK");
            wire::write_reply(&mut self.writer, '+', "OK").await?;
        }
    }

    async fn do_op(&mut self, op: &wire::Op) -> Result<()> {
        info!("---> {} {}", op.name, op.args.join(" "));
        match op.name.as_str() {
            "cd" => self.cd(required(op, 0)?).await,
            "clone" => self.clone_op(required(op, 0)?).await,
            "ls" => self.ls().await,
            "ps" => self.ps().await,
            "name" => {
                self.root
                    .name_child(required(op, 0)?, &self.context_path)
                    .await
            }
            _ => self.dispatch(op).await,
        }
    }

    /// Moves the context. Relative paths resolve against the current logical
    /// context path, not the on-disk layout.
    async fn cd(&mut self, path: &str) -> Result<()> {
        let context_path = if path.starts_with('/') {
            clean_logical(path)
        } else {
            clean_logical(&format!("{}/{path}", self.context_path))
        };
        let context = self.root.get_child(&context_path).await?;
        self.context = context;
        self.context_path = context_path;
        Ok(())
    }

    async fn clone_op(&mut self, src: &str) -> Result<()> {
        let src = self.root.get_child(src).await?;
        if clean_logical(&src.root.to_string_lossy())
            == clean_logical(&self.context.root.to_string_lossy())
        {
            bail_locationless!("Can't clone: circular reference")
        }
        copy_with_tar(&src.root, &self.context.root).await?;
        info!("cloned {} into {}", src.id, self.context.id);
        Ok(())
    }

    async fn ls(&mut self) -> Result<()> {
        for name in self.context.list_children().await? {
            println!("{name}");
        }
        Ok(())
    }

    /// Lists every stored command of every child of the context
    async fn ps(&mut self) -> Result<()> {
        for c_name in self.context.list_children().await? {
            let c = match self.context.get_child(&c_name).await {
                Ok(c) => c,
                Err(_) => {
                    debug!("can't load container {c_name}");
                    continue;
                }
            };
            debug!("child = {c:?}");
            for cmd_name in crate::container::ls(&c.path(".docker/run/exec")).await? {
                match c.get_command(&cmd_name).await {
                    Ok(cmd) => {
                        println!("{}:{}\t{} {}", c.id, cmd_name, cmd.path, cmd.args.join(" "))
                    }
                    Err(_) => debug!("can't load command {c_name}:{cmd_name}"),
                }
            }
        }
        Ok(())
    }

    /// Everything that is not a built-in becomes an engine-mode helper run
    /// inside the root container, recorded on the context first so that `ps`
    /// can observe it.
    async fn dispatch(&mut self, op: &wire::Op) -> Result<()> {
        debug!("preparing to execute command in context {}", self.context.id);
        let mut cmd = Cmd::new("docker");
        cmd.args.push("-e".to_owned());
        cmd.args.push(op.name.clone());
        cmd.args.extend(op.args.iter().cloned());
        // ...with the current context as cwd (relative to the container)
        cmd.dir = container_path(&self.context_path);
        debug!("cmd.dir = {}", cmd.dir);
        self.context.set_command("", &cmd).await?;
        let hook_env = new_env(&self.root.root.to_string_lossy(), &cmd.env);
        self.engine
            .hooks
            .execute("engine", &op.name, HookMode::Pre, &hook_env)
            .await?;
        // execute the command as a process inside c0
        let command = cmd
            .command(&self.root.root)
            .await?
            .recording(false)
            .forward(true)
            .forward_line_prefix(Some(String::new()));
        debug!("starting command");
        command.run_to_completion().await?.assert_success()?;
        debug!("command returned");
        self.engine
            .hooks
            .execute("engine", &op.name, HookMode::Post, &hook_env)
            .await?;
        Ok(())
    }
}

fn required<'a>(op: &'a wire::Op, index: usize) -> Result<&'a str> {
    match op.args.get(index) {
        Some(arg) => Ok(arg.as_str()),
        None => bail_locationless!("{} is missing argument #{}", op.name, index + 1),
    }
}
