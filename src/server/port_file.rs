//! Port rendezvous file.
//!
//! The listener writes its OS-assigned port to
//! `{support_dir}/server.port` once it is accepting connections; bridge
//! processes poll the file to find the server. The containing directory is
//! created owner-only (0700) and the file itself 0600.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config;

/// Polling interval while waiting for the file to appear.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default budget for [`read_with_timeout`].
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Path of the port file inside a support directory.
pub fn path(support_dir: &Path) -> PathBuf {
    config::port_file_path(support_dir)
}

/// Write the port file atomically, creating the support directory with
/// owner-only permissions first.
pub async fn write(support_dir: &Path, port: u16) -> io::Result<()> {
    tokio::fs::create_dir_all(support_dir).await?;
    set_mode(support_dir, 0o700).await?;

    let target = path(support_dir);
    let tmp = target.with_extension("port.tmp");
    tokio::fs::write(&tmp, port.to_string()).await?;
    set_mode(&tmp, 0o600).await?;
    tokio::fs::rename(&tmp, &target).await?;

    debug!(port, path = %target.display(), "Wrote port file");
    Ok(())
}

/// Delete the port file. Missing files are not an error.
pub async fn delete(support_dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path(support_dir)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read and parse the port file once.
pub async fn read(support_dir: &Path) -> Option<u16> {
    let raw = tokio::fs::read_to_string(path(support_dir)).await.ok()?;
    raw.trim().parse().ok()
}

/// Poll for the port file until it parses or the budget is spent.
pub async fn read_with_timeout(support_dir: &Path, budget: Duration) -> Option<u16> {
    let deadline = Instant::now() + budget;
    loop {
        if let Some(port) = read(support_dir).await {
            return Some(port);
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(READ_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let support = dir.path().join("iMCP");

        write(&support, 49152).await.unwrap();
        assert_eq!(read(&support).await, Some(49152));

        delete(&support).await.unwrap();
        assert_eq!(read(&support).await, None);
        // Deleting again is fine.
        delete(&support).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let support = dir.path().join("iMCP");
        write(&support, 50000).await.unwrap();

        let dir_mode = std::fs::metadata(&support).unwrap().permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(path(&support)).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[tokio::test]
    async fn test_read_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let support = dir.path().to_path_buf();
        tokio::fs::write(path(&support), "not-a-port").await.unwrap();
        assert_eq!(read(&support).await, None);
    }

    #[tokio::test]
    async fn test_read_with_timeout_sees_late_write() {
        let dir = tempfile::tempdir().unwrap();
        let support = dir.path().join("iMCP");

        let support_clone = support.clone();
        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(400)).await;
            write(&support_clone, 51000).await.unwrap();
        });

        let port = read_with_timeout(&support, Duration::from_secs(5)).await;
        writer.await.unwrap();
        assert_eq!(port, Some(51000));
    }

    #[tokio::test]
    async fn test_read_with_timeout_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let port = read_with_timeout(dir.path(), Duration::from_millis(300)).await;
        assert_eq!(port, None);
    }
}
