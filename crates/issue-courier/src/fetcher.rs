//! Artifact download.
//!
//! Pulls the issue file through the signed-in browser, unpacks it when the
//! portal serves a ZIP, and stages it under the downloads directory until
//! the mailer is done with it. Whether to unpack is decided by the link and
//! by the response itself, since an `EPUB` link may still answer with an
//! archive.

use crate::auth::AuthenticatedSession;
use crate::browser::{Download, PortalBrowser};
use crate::error::{CourierError, CourierResult};
use crate::locator::{ArtifactFormat, DownloadReference};
use anyhow::{bail, Context};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

/// Local file header signature shared by ZIP archives and EPUB files.
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// A downloaded issue staged on disk.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub issue: String,
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

impl Artifact {
    /// Delete the staged file. Missing files are fine.
    pub fn discard(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "artifact removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "could not remove artifact"),
        }
    }
}

pub struct ArtifactFetcher {
    downloads_dir: PathBuf,
    download_limit: u64,
}

impl ArtifactFetcher {
    pub fn new(downloads_dir: PathBuf, download_limit: u64) -> Self {
        Self {
            downloads_dir,
            download_limit,
        }
    }

    /// Download `reference` for `issue` and stage it as an EPUB file.
    pub async fn fetch<B>(
        &self,
        browser: &mut B,
        issue: &str,
        reference: &DownloadReference,
        session: &AuthenticatedSession,
    ) -> CourierResult<Artifact>
    where
        B: PortalBrowser + ?Sized,
    {
        debug!(url = %reference.url, via = ?session.method, "downloading artifact");
        let download = browser
            .download(&reference.url, self.download_limit)
            .await
            .with_context(|| format!("download of '{issue}' failed"))
            .map_err(CourierError::download)?;

        if download.bytes.is_empty() {
            return Err(CourierError::Download(format!(
                "{} returned an empty body",
                download.final_url
            )));
        }

        if !download.bytes.starts_with(ZIP_MAGIC) {
            return Err(CourierError::Download(not_a_package(&download)));
        }

        let zipped = reference.format == ArtifactFormat::ZippedEpub || looks_zipped(&download);
        let (file_name, bytes) = if zipped {
            debug!(url = %download.final_url, "unpacking archive");
            let (entry, bytes) = extract_epub(&download.bytes, self.download_limit)
                .with_context(|| format!("cannot unpack archive from {}", download.final_url))
                .map_err(CourierError::download)?;
            let name = sanitize_file_name(&entry).unwrap_or_else(|| fallback_name(issue));
            (with_epub_extension(name), bytes)
        } else {
            let name = download
                .suggested_name
                .as_deref()
                .and_then(sanitize_file_name)
                .unwrap_or_else(|| fallback_name(issue));
            (with_epub_extension(name), download.bytes)
        };
        if bytes.is_empty() {
            return Err(CourierError::Download(format!(
                "EPUB inside {} is empty",
                download.final_url
            )));
        }

        let path = self.downloads_dir.join(&file_name);
        write_file(&self.downloads_dir, &path, &bytes)
            .await
            .map_err(CourierError::download)?;

        let size = bytes.len() as u64;
        info!(issue, path = %path.display(), bytes = size, "artifact downloaded");
        Ok(Artifact {
            issue: issue.to_string(),
            path,
            file_name,
            size,
        })
    }
}

/// The response names or types itself as a ZIP archive.
fn looks_zipped(download: &Download) -> bool {
    let is_zip_name = |name: &str| name.to_ascii_lowercase().ends_with(".zip");
    if download.suggested_name.as_deref().is_some_and(is_zip_name) {
        return true;
    }
    if Url::parse(&download.final_url).is_ok_and(|u| is_zip_name(u.path())) {
        return true;
    }
    download.content_type.as_deref().is_some_and(|ct| {
        let ct = ct.to_ascii_lowercase();
        ct.starts_with("application/zip") || ct.starts_with("application/x-zip")
    })
}

fn not_a_package(download: &Download) -> String {
    let first = download.bytes.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'<') {
        format!(
            "{} returned an HTML page instead of a file (session expired?)",
            download.final_url
        )
    } else {
        format!(
            "{} did not return an EPUB or ZIP file (content type {})",
            download.final_url,
            download.content_type.as_deref().unwrap_or("unknown")
        )
    }
}

async fn write_file(dir: &Path, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

/// First `.epub` entry of a ZIP archive, as `(entry file name, contents)`.
pub fn extract_epub(archive: &[u8], max_bytes: u64) -> anyhow::Result<(String, Vec<u8>)> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).context("not a ZIP archive")?;
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        if !entry.is_file() || !entry.name().to_ascii_lowercase().ends_with(".epub") {
            continue;
        }
        if entry.size() > max_bytes {
            bail!("'{}' unpacks to {} bytes, above the limit", entry.name(), entry.size());
        }
        let name = entry
            .name()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let mut bytes = Vec::new();
        entry.take(max_bytes + 1).read_to_end(&mut bytes)?;
        if bytes.len() as u64 > max_bytes {
            bail!("'{name}' unpacks past the size limit");
        }
        return Ok((name, bytes));
    }
    bail!("archive contains no EPUB file")
}

/// Strip anything that could escape the downloads directory or upset a mail client.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

fn fallback_name(issue: &str) -> String {
    sanitize_file_name(&issue.replace(['/', '\\'], "-"))
        .map(|s| format!("{s}.epub"))
        .unwrap_or_else(|| "issue.epub".to_string())
}

fn with_epub_extension(name: String) -> String {
    if name.to_ascii_lowercase().ends_with(".epub") {
        name
    } else {
        format!("{name}.epub")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::browser::{FormSubmission, Page};
    use crate::error::ErrorKind;
    use crate::session::SessionState;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Serves one canned download.
    struct CannedDownload(Download);

    #[async_trait]
    impl PortalBrowser for CannedDownload {
        async fn navigate(&mut self, url: &str) -> anyhow::Result<Page> {
            bail!("unexpected navigation to {url}")
        }
        async fn submit(&mut self, form: &FormSubmission) -> anyhow::Result<Page> {
            bail!("unexpected submit to {}", form.action)
        }
        async fn download(&mut self, _url: &str, _max_bytes: u64) -> anyhow::Result<Download> {
            Ok(self.0.clone())
        }
        fn export_state(&self) -> SessionState {
            SessionState::new("gihyo.jp", Default::default())
        }
        fn restore_state(&mut self, _state: &SessionState) {}
        fn clear_state(&mut self) {}
        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    const EPUB_LINK: &str = "https://gihyo.jp/dp/download?id=978-1&format=epub";

    fn served(final_url: &str, content_type: &str, name: Option<&str>, bytes: Vec<u8>) -> CannedDownload {
        CannedDownload(Download {
            url: EPUB_LINK.into(),
            final_url: final_url.into(),
            content_type: Some(content_type.into()),
            suggested_name: name.map(String::from),
            bytes,
        })
    }

    fn session() -> AuthenticatedSession {
        AuthenticatedSession {
            method: AuthMethod::Login,
            landing_url: "https://gihyo.jp/dp/my-page".into(),
            established_at: Utc::now(),
        }
    }

    fn reference(format: ArtifactFormat) -> DownloadReference {
        DownloadReference {
            url: EPUB_LINK.into(),
            format,
        }
    }

    async fn fetch_from(
        dir: &Path,
        browser: &mut CannedDownload,
        format: ArtifactFormat,
    ) -> CourierResult<Artifact> {
        ArtifactFetcher::new(dir.to_path_buf(), 1024 * 1024)
            .fetch(browser, "2024-05", &reference(format), &session())
            .await
    }

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            for (name, data) in entries {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[tokio::test]
    async fn test_epub_link_served_as_zip_is_unpacked() {
        let dir = tempfile::tempdir().unwrap();
        let archive = zip_with(&[("SD202405.epub", &b"PK\x03\x04inner-epub"[..])]);
        let mut browser = served(
            "https://cdn.gihyo.jp/files/SD202405.zip",
            "application/octet-stream",
            Some("SD202405.zip"),
            archive,
        );
        let artifact = fetch_from(dir.path(), &mut browser, ArtifactFormat::Epub)
            .await
            .unwrap();
        assert_eq!(artifact.file_name, "SD202405.epub");
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"PK\x03\x04inner-epub");
    }

    #[tokio::test]
    async fn test_zip_content_type_alone_triggers_unpack() {
        let dir = tempfile::tempdir().unwrap();
        let archive = zip_with(&[("sd/SD202406.epub", &b"PK\x03\x04june"[..])]);
        let mut browser = served(EPUB_LINK, "application/zip", None, archive);
        let artifact = fetch_from(dir.path(), &mut browser, ArtifactFormat::Epub)
            .await
            .unwrap();
        assert_eq!(artifact.file_name, "SD202406.epub");
        assert_eq!(artifact.size, 8);
    }

    #[tokio::test]
    async fn test_zipped_link_is_unpacked() {
        let dir = tempfile::tempdir().unwrap();
        let archive = zip_with(&[("SD202405.epub", &b"PK\x03\x04inner"[..])]);
        let mut browser = served(EPUB_LINK, "application/octet-stream", None, archive);
        let artifact = fetch_from(dir.path(), &mut browser, ArtifactFormat::ZippedEpub)
            .await
            .unwrap();
        assert_eq!(artifact.file_name, "SD202405.epub");
    }

    #[tokio::test]
    async fn test_plain_epub_kept_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let mut browser = served(
            EPUB_LINK,
            "application/epub+zip",
            Some("SD202405.epub"),
            b"PK\x03\x04mimetypeapplication/epub+zip".to_vec(),
        );
        let artifact = fetch_from(dir.path(), &mut browser, ArtifactFormat::Epub)
            .await
            .unwrap();
        assert_eq!(artifact.file_name, "SD202405.epub");
        assert_eq!(artifact.size, 32);
    }

    #[tokio::test]
    async fn test_login_page_with_binary_content_type_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut browser = served(
            EPUB_LINK,
            "application/octet-stream",
            Some("SD202405.epub"),
            b"\n  <!DOCTYPE html><form action=\"/site/signin\">".to_vec(),
        );
        let err = fetch_from(dir.path(), &mut browser, ArtifactFormat::Epub)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Download);
        assert!(err.to_string().contains("HTML page"));
        assert_eq!(std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_non_package_body_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut browser = served(EPUB_LINK, "text/plain", None, b"%PDF-1.7".to_vec());
        let err = fetch_from(dir.path(), &mut browser, ArtifactFormat::Epub)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not return an EPUB or ZIP"));
    }

    #[test]
    fn test_extract_first_epub() {
        let archive = zip_with(&[
            ("readme.txt", &b"hello"[..]),
            ("sd/SD202405.epub", &b"PK-epub-one"[..]),
            ("sd/SD202405-2.epub", &b"PK-epub-two"[..]),
        ]);
        let (name, bytes) = extract_epub(&archive, 1024).unwrap();
        assert_eq!(name, "SD202405.epub");
        assert_eq!(bytes, b"PK-epub-one");
    }

    #[test]
    fn test_extract_without_epub_fails() {
        let archive = zip_with(&[("SD202405.pdf", &b"%PDF"[..])]);
        let err = extract_epub(&archive, 1024).unwrap_err();
        assert!(err.to_string().contains("no EPUB"));
    }

    #[test]
    fn test_extract_rejects_oversize_entry() {
        let archive = zip_with(&[("big.epub", &[0u8; 64][..])]);
        assert!(extract_epub(&archive, 16).is_err());
    }

    #[test]
    fn test_extract_rejects_non_zip() {
        assert!(extract_epub(b"<html>login</html>", 1024).is_err());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(
            sanitize_file_name("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_file_name("SD 2024:05?.epub").as_deref(),
            Some("SD 2024_05_.epub")
        );
        assert_eq!(sanitize_file_name(" .. ").as_deref(), None);
    }

    #[test]
    fn test_fallback_name() {
        assert_eq!(fallback_name("2024/05"), "2024-05.epub");
        assert_eq!(
            fallback_name("Software Design 2024年5月号"),
            "Software Design 2024年5月号.epub"
        );
    }

    #[test]
    fn test_discard_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.epub");
        std::fs::write(&path, b"x").unwrap();
        let artifact = Artifact {
            issue: "2024-05".into(),
            path: path.clone(),
            file_name: "gone.epub".into(),
            size: 1,
        };
        artifact.discard();
        assert!(!path.exists());
        artifact.discard();
    }
}
