use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use nimbus_remote::Node;
use nimbus_sync::SyncController;
use std::path::{Path, PathBuf};

fn kind(node: &Node) -> char {
    match (node.is_folder, node.is_trashed()) {
        (_, true) => 't',
        (true, false) => 'd',
        (false, false) => '-',
    }
}

async fn resolve(controller: &SyncController, remote_path: &str) -> Result<Node> {
    controller
        .resolve_path(remote_path)
        .await
        .or_raise(|| ErrorKind::Failed)?
        .ok_or_raise(|| ErrorKind::NotFound(remote_path.to_string()))
}

async fn resolve_folder(controller: &SyncController, remote_path: &str) -> Result<Node> {
    let node = resolve(controller, remote_path).await?;
    if !node.is_folder {
        exn::bail!(ErrorKind::NotAFolder(remote_path.to_string()));
    }
    Ok(node)
}

/// Split `/a/b/c` into (`/a/b`, `c`), ignoring trailing slashes.
fn split_parent(remote_path: &str) -> Option<(&str, &str)> {
    let trimmed = remote_path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
    (!name.is_empty()).then_some((parent, name))
}

pub async fn sync(controller: &SyncController) -> Result<()> {
    if !controller.sync().await.or_raise(|| ErrorKind::Failed)? {
        exn::bail!(ErrorKind::Rejected);
    }
    Ok(())
}

pub async fn status(controller: &SyncController) -> Result<()> {
    let status = controller.status().await.or_raise(|| ErrorKind::Failed)?;
    match status.checkpoint {
        Some(checkpoint) => println!("checkpoint: {checkpoint}"),
        None => println!("checkpoint: never synced"),
    }
    match status.last_sync {
        Some(when) => println!("last sync:  {when}"),
        None => println!("last sync:  never"),
    }
    println!("nodes:      {}", status.nodes);
    Ok(())
}

pub async fn ls(controller: &SyncController, remote_path: &str) -> Result<()> {
    let node = resolve(controller, remote_path).await?;
    let entries = if node.is_folder {
        controller.get_children(&node).await.or_raise(|| ErrorKind::Failed)?
    } else {
        vec![node]
    };
    for entry in entries {
        let size = entry.size.map(|s| s.to_string()).unwrap_or_default();
        println!("{} {:>12} {} {}", kind(&entry), size, entry.id, entry.name);
    }
    Ok(())
}

pub async fn find(controller: &SyncController, pattern: &str) -> Result<()> {
    for node in controller.find_by_regex(pattern).await.or_raise(|| ErrorKind::Failed)? {
        match controller.get_path(&node).await {
            Ok(path) => println!("{} {} {path}", kind(&node), node.id),
            Err(error) if error.needs_resync() => {
                tracing::warn!(node = %node.id, "node is detached from the tree; run a sync");
                println!("{} {} ?/{}", kind(&node), node.id, node.name);
            },
            Err(error) => return Err(error.raise(ErrorKind::Failed)),
        }
    }
    Ok(())
}

pub async fn mkdir(controller: &SyncController, remote_path: &str) -> Result<()> {
    let (parent_path, name) = split_parent(remote_path).ok_or_raise(|| ErrorKind::NotFound(remote_path.to_string()))?;
    let parent = resolve_folder(controller, parent_path).await?;
    let folder = controller.create_directory(&parent, name).await.or_raise(|| ErrorKind::Rejected)?;
    println!("{}", folder.id);
    Ok(())
}

pub async fn upload(controller: &SyncController, local_path: &Path, remote_dir: &str) -> Result<()> {
    let parent = resolve_folder(controller, remote_dir).await?;
    let node = controller.upload_file(&parent, local_path).await.or_raise(|| ErrorKind::Rejected)?;
    println!("{}", node.id);
    Ok(())
}

/// Download a file and check its MD5 against the one the cache recorded.
pub async fn download(controller: &SyncController, remote_path: &str, local_path: &Path) -> Result<()> {
    let node = resolve(controller, remote_path).await?;
    if node.is_folder {
        exn::bail!(ErrorKind::IsAFolder(remote_path.to_string()));
    }
    let target: PathBuf = if local_path.is_dir() { local_path.join(&node.name) } else { local_path.to_path_buf() };
    if let Some(dir) = target.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.or_raise(|| ErrorKind::LocalIo(dir.to_path_buf()))?;
    }
    let actual = controller.download_node(&node, &target).await.or_raise(|| ErrorKind::Rejected)?;
    match node.md5 {
        Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
            exn::bail!(ErrorKind::ChecksumMismatch {
                path: target.display().to_string(),
                expected,
                actual,
            });
        },
        Some(_) => tracing::debug!(md5 = %actual, "checksum verified"),
        None => tracing::warn!(node = %node.id, "no recorded checksum to verify against"),
    }
    println!("{}", target.display());
    Ok(())
}

pub async fn trash(controller: &SyncController, remote_path: &str) -> Result<()> {
    let node = resolve(controller, remote_path).await?;
    if !controller.trash(&node.id).await.or_raise(|| ErrorKind::Failed)? {
        exn::bail!(ErrorKind::Rejected);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/docs/new", Some(("/docs", "new")))]
    #[case("/docs/new/", Some(("/docs", "new")))]
    #[case("/new", Some(("", "new")))]
    #[case("new", Some(("", "new")))]
    #[case("/", None)]
    #[case("", None)]
    fn test_split_parent(#[case] path: &str, #[case] expected: Option<(&str, &str)>) {
        assert_eq!(split_parent(path), expected);
    }
}
