//! On-disk layout of the offline copy.
//!
//! ```text
//! <download_path>/Offline Mode/
//!     article/            saved pages
//!     video/              downloaded videos
//!     archive/article/    pages of bookmarks removed upstream
//!     archive/video/
//!     .staging/           in-progress writes, renamed into place on commit
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

use super::FetchedContent;
use crate::util::content_file_name;

pub const ROOT_FOLDER_NAME: &str = "Offline Mode";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Independently fetched content aspect of a bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    Article,
    Video,
}

impl Facet {
    fn dir_name(&self) -> &'static str {
        match self {
            Facet::Article => "article",
            Facet::Video => "video",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadLayout {
    root: PathBuf,
}

impl DownloadLayout {
    /// Resolve the offline root under `download_path` and create its folders.
    ///
    /// `download_path` itself is used when it is already named
    /// "Offline Mode"; otherwise an existing child of that name (any case)
    /// is reused before a new one is created.
    pub async fn prepare(download_path: &Path) -> io::Result<Self> {
        let root = resolve_root(download_path).await?;
        let layout = Self { root };

        for dir in [
            layout.facet_dir(Facet::Article),
            layout.facet_dir(Facet::Video),
            layout.archive_dir(Facet::Article),
            layout.archive_dir(Facet::Video),
            layout.staging_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        tracing::debug!(root = %layout.root.display(), "Download layout ready");
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn facet_dir(&self, facet: Facet) -> PathBuf {
        self.root.join(facet.dir_name())
    }

    pub fn archive_dir(&self, facet: Facet) -> PathBuf {
        self.root.join("archive").join(facet.dir_name())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }

    /// Move fetched content to its final path.
    ///
    /// Inline content is written to a staging file and synced first; the
    /// final path only ever appears through a rename, so it never holds a
    /// partially written file.
    pub async fn commit(
        &self,
        facet: Facet,
        title: &str,
        id: &str,
        content: FetchedContent,
    ) -> io::Result<PathBuf> {
        let name = content_file_name(title, id, content.extension());
        let target = self.facet_dir(facet).join(name);

        let staged = match content {
            FetchedContent::Inline { bytes, .. } => self.write_staging_file(&bytes).await?,
            FetchedContent::Staged { path, .. } => path,
        };

        if let Err(e) = replace_file(&staged, &target).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
        Ok(target)
    }

    async fn write_staging_file(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        let temp_path = self.staging_dir().join(format!(
            "commit-{}-{}.tmp",
            std::process::id(),
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true) // Fails if file exists (prevents symlink race)
            .open(&temp_path)
            .await?;

        let written = async {
            file.write_all(bytes).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(temp_path)
    }

    /// Move a committed file into the archive. `Ok(None)` when it no longer exists.
    pub async fn archive(&self, facet: Facet, path: &Path) -> io::Result<Option<PathBuf>> {
        self.move_into(path, &self.archive_dir(facet)).await
    }

    /// Move an archived file back to the active folder. `Ok(None)` when it no longer exists.
    pub async fn restore(&self, facet: Facet, path: &Path) -> io::Result<Option<PathBuf>> {
        self.move_into(path, &self.facet_dir(facet)).await
    }

    async fn move_into(&self, path: &Path, dir: &Path) -> io::Result<Option<PathBuf>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }
        let Some(name) = path.file_name() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' has no file name", path.display()),
            ));
        };
        let target = dir.join(name);
        if target == path {
            return Ok(Some(target));
        }
        replace_file(path, &target).await?;
        Ok(Some(target))
    }
}

/// Rename `src` over `dst`. Same-filesystem renames are atomic on POSIX.
async fn replace_file(src: &Path, dst: &Path) -> io::Result<()> {
    // On Windows, rename fails if destination exists, so remove it first
    #[cfg(windows)]
    if tokio::fs::try_exists(dst).await? {
        tokio::fs::remove_file(dst).await?;
    }
    tokio::fs::rename(src, dst).await
}

async fn resolve_root(download_path: &Path) -> io::Result<PathBuf> {
    let is_root_name =
        |name: &std::ffi::OsStr| name.to_string_lossy().eq_ignore_ascii_case(ROOT_FOLDER_NAME);

    if download_path.file_name().is_some_and(is_root_name) {
        return Ok(download_path.to_path_buf());
    }

    tokio::fs::create_dir_all(download_path).await?;
    let mut entries = tokio::fs::read_dir(download_path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if is_root_name(entry.file_name().as_os_str()) && entry.file_type().await?.is_dir() {
            return Ok(entry.path());
        }
    }

    Ok(download_path.join(ROOT_FOLDER_NAME))
}
