use std::path::Path;

use stacked_errors::{Result, StackableErr};
use tokio::task;

// Tree copies go through a tar stream rather than a recursive copy so that
// permissions, symlinks, and special files survive the trip the same way
// they would through the container's own `tar`.

/// Copies the tree below `src` into `dst` through an in-memory tar stream
pub async fn copy_with_tar(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref().to_owned();
    let dst = dst.as_ref().to_owned();
    task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", &src)
            .stack_err_with(|| format!("copy_with_tar -> can't archive {src:?}"))?;
        let data = builder
            .into_inner()
            .stack_err("copy_with_tar -> can't finish archive")?;
        unpack(&data, &dst)
    })
    .await
    .stack_err("copy_with_tar -> archive task panicked")?
}

/// Unpacks a tar archive into `dst`
pub async fn untar(data: Vec<u8>, dst: impl AsRef<Path>) -> Result<()> {
    let dst = dst.as_ref().to_owned();
    task::spawn_blocking(move || unpack(&data, &dst))
        .await
        .stack_err("untar -> archive task panicked")?
}

fn unpack(data: &[u8], dst: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(data));
    archive.set_preserve_permissions(true);
    // clone targets may already carry engine state; later layers win
    archive.set_overwrite(true);
    archive
        .unpack(dst)
        .stack_err_with(|| format!("can't unpack archive into {dst:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tree_copy_preserves_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("a/b/f"), b"payload").unwrap();
        std::fs::write(src.join("top"), b"x").unwrap();
        std::os::unix::fs::symlink("a/b/f", src.join("link")).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        copy_with_tar(&src, &dst).await.unwrap();
        assert_eq!(std::fs::read(dst.join("a/b/f")).unwrap(), b"payload");
        assert_eq!(std::fs::read(dst.join("top")).unwrap(), b"x");
        let link = std::fs::read_link(dst.join("link")).unwrap();
        assert_eq!(link.to_str(), Some("a/b/f"));
    }

    #[tokio::test]
    async fn untar_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "hello.txt", &b"hello"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();
        untar(data, tmp.path()).await.unwrap();
        assert_eq!(std::fs::read(tmp.path().join("hello.txt")).unwrap(), b"hello");
    }
}
