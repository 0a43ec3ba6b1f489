use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use stacked_errors::{bail, Result, StackableErr};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use crate::{
    atomic_symlink, container_path, mk_unique_dir, paths::mkdir_all, self_exe_path, Command,
};

/// Environment preamble for containerized processes. At spawn time the three
/// path-valued keys are rewritten against the container root; see [new_env].
pub const BASE_ENV: [(&str, &str); 3] = [
    ("HOME", "/"),
    (
        "PATH",
        "/.docker/bin:/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin:/bin:/sbin",
    ),
    // DOCKER_ROOT points to the root of the container. In a chrooted
    // environment this would default to /
    ("DOCKER_ROOT", "/"),
];

// extra engine entry points linked beside the copied binary
const BIN_ALIASES: [&str; 4] = ["exec", "start", "stop", "commit"];

/// A view onto one container of the filesystem tree. The `id` is `"0"` for
/// the root container, a decimal string for allocated children. Owns no
/// handles; all state is on disk beneath `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub root: PathBuf,
}

/// A stored command manifest: what `run/exec/<name>/` persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cmd {
    /// Program, resolved against the rewritten `PATH` at spawn time
    pub path: String,
    pub args: Vec<String>,
    /// Overrides merged over [BASE_ENV]. Keys may not contain `=`.
    pub env: Vec<(String, String)>,
    /// Working directory relative to the container root
    pub dir: String,
}

impl Container {
    /// A plain view with no filesystem setup
    pub fn view(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }

    /// Materializes a fresh container at `root`: the hidden `.docker` subtree,
    /// a `tar` symlink, a copy of the engine binary, and the engine entry
    /// point links. A failure part way through removes whatever portion of
    /// `.docker` this call created.
    pub async fn create(id: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_owned()
        } else {
            std::env::current_dir()
                .stack_err("Container::create -> no current directory")?
                .join(root)
                .components()
                .collect()
        };
        let c = Self {
            id: id.into(),
            root,
        };
        let docker_dir = c.path(".docker");
        let preexisting = fs::try_exists(&docker_dir).await.unwrap_or(false);
        match c.setup().await {
            Ok(()) => Ok(c),
            Err(e) => {
                if !preexisting {
                    let _ = fs::remove_dir_all(&docker_dir).await;
                }
                Err(e).stack_err_with_locationless(|| format!("Container::create({:?})", c.root))
            }
        }
    }

    async fn setup(&self) -> Result<()> {
        mkdir_all(self.path(".docker"))
            .await
            .stack_err("can't create .docker")?;
        mkdir_all(self.path(".docker/bin"))
            .await
            .stack_err("can't create .docker/bin")?;
        // the container gets the host tar and its own copy of the engine
        let system_tar = host_look_path("tar").stack_err("no system tar on PATH")?;
        atomic_symlink(&system_tar, self.path(".docker/bin/tar")).await?;
        // FIXME: create a hardlink if possible
        let self_path = self_exe_path()?;
        fs::copy(&self_path, self.path(".docker/bin/docker"))
            .await
            .stack_err_with(|| format!("can't copy {self_path:?} into the container"))?;
        for alias in BIN_ALIASES {
            atomic_symlink("docker", self.path(&format!(".docker/bin/{alias}"))).await?;
        }
        Ok(())
    }

    /// Joins a `/`-separated relative path under the container root. A
    /// leading `/` on `p` is treated as relative to the root, matching the
    /// logical-path convention of the wire ops.
    pub fn path(&self, p: &str) -> PathBuf {
        let mut out = self.root.clone();
        for part in p.split('/').filter(|s| !s.is_empty()) {
            out.push(part);
        }
        out
    }

    /// Resolves a logical (possibly `/`-separated) name to a child container.
    /// The empty name, `"/"`, and `"."` resolve to the container itself. A
    /// name whose embedded path does not exist on disk is an error; callers
    /// that only introspect may skip such children.
    pub async fn get_child(&self, name: &str) -> Result<Self> {
        let real_path = container_path(name);
        debug!("real_path = {real_path}");
        if real_path.is_empty() {
            return Ok(self.clone());
        }
        let child = Self {
            id: base_name(name),
            root: self.path(&real_path),
        };
        fs::metadata(&child.root)
            .await
            .stack_err_with(|| format!("get_child({name}) -> no container at {:?}", child.root))?;
        Ok(child)
    }

    /// Sorted ids of the child containers. A missing store directory is an
    /// empty list, not an error.
    pub async fn list_children(&self) -> Result<Vec<String>> {
        ls(&self.path(".docker/engine/containers")).await
    }

    /// Allocates the next free decimal id and materializes a container there
    pub async fn create_child(&self) -> Result<Self> {
        let store = self.path(".docker/engine/containers");
        let id = mk_unique_dir(&store, "", "").await?;
        let child_root = store.join(&id);
        debug!("created new container: {id} at root {child_root:?}");
        Self::create(id, child_root).await
    }

    /// Points the alias `name` (which may contain `/`) at `target`. The alias
    /// lives in the same interposed `.docker/engine/containers` embedding the
    /// children do.
    pub async fn name_child(&self, name: &str, target: &str) -> Result<()> {
        let alias = container_path(name);
        if alias.is_empty() {
            bail!("name_child({name}) -> not a nameable path")
        }
        atomic_symlink(target, self.path(&alias)).await
    }

    /// Loads the stored command `name`. An unreadable `cmd` file is an error;
    /// a missing working directory or env directory is not.
    pub async fn get_command(&self, name: &str) -> Result<Cmd> {
        let base = format!(".docker/run/exec/{name}");
        let mut cmd = Cmd::default();
        let cmdline = fs::read_to_string(self.path(&format!("{base}/cmd")))
            .await
            .stack_err_with(|| format!("get_command({name}) -> can't load command line"))?;
        let mut parts = cmdline.split('\0');
        cmd.path = parts.next().unwrap_or_default().to_owned();
        cmd.args = parts.map(str::to_owned).collect();
        match fs::read_to_string(self.path(&format!("{base}/wd"))).await {
            Ok(wd) => cmd.dir = wd,
            Err(_) => debug!("no working directory"),
        }
        // absent env/ means the base env is inherited untouched
        for key in ls(&self.path(&format!("{base}/env"))).await? {
            let value = fs::read_to_string(self.path(&format!("{base}/env/{key}")))
                .await
                .stack_err_with(|| format!("get_command({name}) -> can't load env {key}"))?;
            cmd.env.push((key, value));
        }
        Ok(cmd)
    }

    /// Persists `cmd` under `run/exec/<name>/`, allocating a decimal name
    /// when `name` is empty. Returns the canonical name the command was
    /// recorded under.
    pub async fn set_command(&self, name: &str, cmd: &Cmd) -> Result<String> {
        let name = mk_unique_dir(self.path(".docker/run/exec"), "", name).await?;
        let base = format!(".docker/run/exec/{name}");
        debug!("storing {}:{} on {:?}", self.id, name, self.path(&base));
        let mut cmdline = vec![cmd.path.as_str()];
        cmdline.extend(cmd.args.iter().map(String::as_str));
        write_file(&self.path(&format!("{base}/cmd")), &cmdline.join("\0")).await?;
        for (key, value) in &cmd.env {
            write_file(&self.path(&format!("{base}/env/{key}")), value).await?;
        }
        write_file(&self.path(&format!("{base}/wd")), &cmd.dir).await?;
        Ok(name)
    }
}

impl Cmd {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Realizes the manifest into a runnable [Command] that "believes" it
    /// lives inside the container at `root`: the base env is merged with the
    /// overrides and rebased, the program is looked up on the rewritten
    /// `PATH`, and the working directory is joined under `root`.
    pub async fn command(&self, root: &Path) -> Result<Command> {
        let prefix = root
            .to_str()
            .stack_err("Cmd::command -> container root is not UTF-8")?;
        let real_env = new_env(prefix, &self.env);
        let real_path = look_path(&self.path, &real_env).await?;
        let mut cwd = root.to_owned();
        for part in self.dir.split('/').filter(|s| !s.is_empty()) {
            // FIXME: this is vulnerable to untrusted input, ../.. etc.
            cwd.push(part);
        }
        debug!(
            "running {real_path:?} in {cwd:?} with PATH={}",
            getenv("PATH", &real_env).unwrap_or_default()
        );
        Ok(Command::new_os_str(real_path)
            .args(&self.args)
            .env_clear(true)
            .envs(real_env)
            .cwd(cwd))
    }
}

/// Builds the environment for a process rooted at `prefix`: [BASE_ENV]
/// followed by `overrides`, with `HOME` and `DOCKER_ROOT` rebased under
/// `prefix` and every `PATH` entry rebased likewise. A value that already
/// starts with `prefix` is left alone, so rewriting an already-rewritten
/// environment is a no-op.
pub fn new_env(prefix: &str, overrides: &[(String, String)]) -> Vec<(String, String)> {
    let base = BASE_ENV
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()));
    let overrides = overrides.iter().cloned();
    base.chain(overrides)
        .map(|(key, value)| {
            let value = match key.as_str() {
                "HOME" | "DOCKER_ROOT" => rebase(prefix, &value),
                // don't use the platform list separator, the stored layout
                // always uses `:`
                "PATH" => value
                    .split(':')
                    .map(|entry| rebase(prefix, entry))
                    .collect::<Vec<String>>()
                    .join(":"),
                _ => value,
            };
            (key, value)
        })
        .collect()
}

fn rebase(prefix: &str, value: &str) -> String {
    if (prefix != "/") && value.starts_with(prefix) {
        return value.to_owned();
    }
    crate::clean_logical(&format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        value.trim_start_matches('/')
    ))
}

/// Last-assignment-wins lookup in an environment list
pub fn getenv(key: &str, env: &[(String, String)]) -> Option<String> {
    env.iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

/// Searches the `PATH` of `env` for `target`, returning the first regular
/// file found. The executable bit is not checked here; the spawn reports
/// that. An absolute `target` is returned unchanged.
pub async fn look_path(target: &str, env: &[(String, String)]) -> Result<String> {
    if target.starts_with('/') {
        return Ok(target.to_owned());
    }
    let search = getenv("PATH", env).unwrap_or_default();
    for search_path in search.split(':').filter(|s| !s.is_empty()) {
        debug!("searching for {target} in {search_path}");
        let p = format!("{search_path}/{target}");
        match fs::metadata(&p).await {
            Ok(st) if st.is_dir() => continue,
            Ok(_) => {
                debug!("found it! {p}");
                return Ok(p);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e).stack_err_with(|| format!("look_path({target})")),
        }
    }
    bail!("look_path({target}) -> executable file not found in $PATH")
}

/// Host-side `PATH` lookup (used only while bootstrapping containers)
pub(crate) fn host_look_path(target: &str) -> Result<PathBuf> {
    let path = std::env::var_os("PATH").stack_err("host_look_path -> no PATH")?;
    for dir in std::env::split_paths(&path) {
        let p = dir.join(target);
        if p.is_file() {
            return Ok(p);
        }
    }
    bail!("host_look_path({target}) -> not found")
}

fn base_name(name: &str) -> String {
    crate::clean_logical(name)
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("/")
        .to_owned()
}

/// Writes `content` to `dst`, creating missing parent directories and
/// truncating any existing file.
pub(crate) async fn write_file(dst: &Path, content: &str) -> Result<()> {
    if let Some(parent) = dst.parent() {
        mkdir_all(parent)
            .await
            .stack_err_with(|| format!("write_file -> can't mkdir {parent:?}"))?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o700);
    let mut f = options
        .open(dst)
        .await
        .stack_err_with(|| format!("write_file -> can't open {dst:?}"))?;
    f.write_all(content.as_bytes())
        .await
        .stack_err_with(|| format!("write_file -> can't write {dst:?}"))?;
    Ok(())
}

/// Sorted filenames of `dir`; a missing directory is an empty list
pub(crate) async fn ls(dir: &Path) -> Result<Vec<String>> {
    let mut rd = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).stack_err_with(|| format!("ls({dir:?})")),
    };
    let mut names = vec![];
    while let Some(entry) = rd
        .next_entry()
        .await
        .stack_err_with(|| format!("ls({dir:?})"))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
