use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use rand::RngCore;
use stacked_errors::{bail, Result, StackableErr};
use tokio::fs;
use tracing::debug;

// Note: we use `dunce::simplify` because of https://github.com/rust-lang/rust/issues/42869
// and because we want to use `tokio::fs`.

/// Canonicalizes and checks the existence of a path. Also adds on better
/// information to errors.
///
/// Note: this does not prevent TOCTOU bugs.
pub async fn acquire_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    // note: we don't need fs::try_exists because the canonicalization deals with
    // testing for existence and the symbolic links
    let mut path = fs::canonicalize(path)
        .await
        .stack_err_with(|| format!("acquire_path(path: {path:?})"))?;
    if cfg!(windows) {
        path = dunce::simplified(&path).to_owned();
    }
    Ok(path)
}

/// Canonicalizes and checks the existence of a file path. Also adds on better
/// information to errors.
///
/// Note: this does not prevent TOCTOU bugs.
pub async fn acquire_file_path(file_path: impl AsRef<Path>) -> Result<PathBuf> {
    let file_path = file_path.as_ref();
    let mut path = fs::canonicalize(file_path)
        .await
        .stack_err_with(|| format!("acquire_file_path(file_path: {file_path:?})"))?;
    if cfg!(windows) {
        path = dunce::simplified(&path).to_owned();
    }
    if path.is_file() {
        Ok(path)
    } else {
        bail!("acquire_file_path(file_path: {file_path:?}) -> is not a file")
    }
}

/// Canonicalizes and checks the existence of a directory path. Also adds on
/// better information to errors.
///
/// Note: this does not prevent TOCTOU bugs.
pub async fn acquire_dir_path(dir_path: impl AsRef<Path>) -> Result<PathBuf> {
    let dir_path = dir_path.as_ref();
    let mut path = fs::canonicalize(dir_path)
        .await
        .stack_err_with(|| format!("acquire_dir_path(dir_path: {dir_path:?})"))?;
    if cfg!(windows) {
        path = dunce::simplified(&path).to_owned();
    }
    if path.is_dir() {
        Ok(path)
    } else {
        bail!("acquire_dir_path(dir_path: {dir_path:?}) -> is not a directory")
    }
}

/// Absolute path of the currently executing binary. The engine cannot
/// bootstrap a container without knowing what to copy into it, so callers
/// treat failure as fatal.
pub fn self_exe_path() -> Result<PathBuf> {
    let path = std::env::current_exe()
        .stack_err("self_exe_path() -> could not resolve the current executable")?;
    if path.is_absolute() {
        Ok(path)
    } else {
        std::fs::canonicalize(&path)
            .stack_err("self_exe_path() -> could not absolutize the current executable")
    }
}

/// 64 hex chars from 32 bytes of OS randomness. Panics on rng failure, which
/// is bootstrap-fatal anyway.
pub fn generate_id() -> String {
    let mut id = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut id);
    let mut s = String::with_capacity(64);
    for b in id {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub(crate) async fn mkdir_all(dir: impl AsRef<Path>) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    builder.mode(0o700);
    builder.create(dir.as_ref()).await
}

async fn mkdir(dir: impl AsRef<Path>) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o700);
    builder.create(dir.as_ref()).await
}

/// Replaces whatever is at `link` with a symlink to `target`, creating parent
/// directories as needed. Emulates `ln -s -f`.
///
/// Known race between the removal and the creation; the engine assumes a
/// single writer per link path.
pub async fn atomic_symlink(target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let (target, link) = (target.as_ref(), link.as_ref());
    match fs::remove_file(link).await {
        Ok(()) => (),
        Err(e) if e.kind() == ErrorKind::NotFound => (),
        Err(e) => {
            return Err(e).stack_err_with(|| format!("atomic_symlink -> can't remove {link:?}"))
        }
    }
    if let Some(parent) = link.parent() {
        mkdir_all(parent)
            .await
            .stack_err_with(|| format!("atomic_symlink -> can't mkdir {parent:?}"))?;
    }
    fs::symlink(target, link)
        .await
        .stack_err_with(|| format!("atomic_symlink({target:?}, {link:?})"))
}

/// Ensures `parent` exists and creates one directory under it.
///
/// With a nonempty `name` the creation of `parent/<prefix><name>` must be
/// fresh, and a conflict is a hard error. With an empty `name`, decimal names
/// are scanned from 1 upward and the first `mkdir` that lands returns; an
/// `AlreadyExists` error is the only admissible retry signal.
pub async fn mk_unique_dir(parent: impl AsRef<Path>, prefix: &str, name: &str) -> Result<String> {
    let parent = parent.as_ref();
    debug!("mk_unique_dir({parent:?}, {prefix:?}, {name:?})");
    mkdir_all(parent)
        .await
        .stack_err_with(|| format!("mk_unique_dir -> can't mkdir {parent:?}"))?;
    if !name.is_empty() {
        mkdir(parent.join(format!("{prefix}{name}")))
            .await
            .stack_err_with(|| format!("mk_unique_dir -> can't allocate {name:?} in {parent:?}"))?;
        return Ok(name.to_owned());
    }
    // TODO store a hint on disk to avoid scanning from 1 every time
    for i in 1..i64::MAX {
        let name = format!("{i}");
        match mkdir(parent.join(format!("{prefix}{name}"))).await {
            Ok(()) => return Ok(name),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e)
                    .stack_err_with(|| format!("mk_unique_dir -> can't allocate in {parent:?}"))
            }
        }
    }
    bail!("mk_unique_dir -> can't allocate any more children in {parent:?}")
}

/// Lexical cleanup of a logical container name: collapses `//` and `.`,
/// resolves `..` against preceding components, keeps absoluteness.
pub fn clean_logical(name: &str) -> String {
    let absolute = name.starts_with('/');
    let mut parts: Vec<&str> = vec![];
    for part in name.split('/') {
        match part {
            "" | "." => (),
            ".." => {
                if let Some(last) = parts.last() {
                    if *last != ".." {
                        parts.pop();
                        continue;
                    }
                }
                if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}

fn container_parts(name: &str) -> Vec<String> {
    clean_logical(name)
        .split('/')
        .filter(|p| !p.is_empty() && (*p != "."))
        .map(str::to_owned)
        .collect()
}

/// Maps a logical container name onto its on-disk path below a root: each
/// path component is reached through an interposed `.docker/engine/containers`
/// segment, so `"a/b"` becomes
/// `"/.docker/engine/containers/a/.docker/engine/containers/b"`. This
/// embedding is part of the on-disk contract; aliases rely on it.
///
/// An empty, `"/"`, or `"."` name returns the empty string, meaning "the
/// context itself".
pub fn container_path(name: &str) -> String {
    if name.is_empty() || (name == "/") || (name == ".") {
        return String::new();
    }
    let parts = container_parts(name);
    if parts.is_empty() {
        return String::new();
    }
    let mut path = String::new();
    for part in parts {
        path.push_str("/.docker/engine/containers/");
        path.push_str(&part);
    }
    clean_logical(&path)
}
