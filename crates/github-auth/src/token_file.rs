//! GitHub token persistence
//!
//! The long-lived GitHub token obtained from the device flow is cached in a
//! single plain-text file so restarts skip the interactive login. Writes go
//! through a temp file in the same directory followed by a rename, and the
//! file is owner read/write only.

use std::path::Path;

use common::Secret;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Read a cached GitHub token.
///
/// A missing file or a file holding only whitespace reads as `None`.
pub async fn read_token_file(path: &Path) -> Result<Option<Secret<String>>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no cached token file");
            return Ok(None);
        }
        Err(e) => return Err(Error::Io(format!("reading token file: {e}"))),
    };

    let token = contents.trim();
    if token.is_empty() {
        return Ok(None);
    }
    Ok(Some(Secret::new(token.to_string())))
}

/// Persist a GitHub token, replacing any previous one.
pub async fn write_token_file(path: &Path, token: &Secret<String>) -> Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating token directory: {e}")))?;

    let tmp_path = dir.join(format!(".github_token.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, token.expose().as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    info!(path = %path.display(), "persisted GitHub token");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let token = read_token_file(&dir.path().join("github_token")).await.unwrap();
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn blank_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("github_token");
        std::fs::write(&path, "  \n").unwrap();
        assert!(read_token_file(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("github_token");
        write_token_file(&path, &Secret::from("ghu_abc")).await.unwrap();

        std::fs::write(&path, "ghu_abc\n").unwrap();
        let token = read_token_file(&path).await.unwrap().unwrap();
        assert_eq!(token.expose(), "ghu_abc");
    }

    #[tokio::test]
    async fn write_replaces_previous_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("github_token");
        write_token_file(&path, &Secret::from("old")).await.unwrap();
        write_token_file(&path, &Secret::from("new")).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp file must be renamed away");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("github_token");
        write_token_file(&path, &Secret::from("ghu_perm")).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
