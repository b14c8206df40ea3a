//! Turns an image source into an uncompressed image file on local disk.
//!
//! A local `.img` is used in place. A local `.img.xz` is decompressed next to
//! itself. A remote image is downloaded with its published SHA-256 checksum,
//! verified, then decompressed. Every file this module creates is owned by a
//! [`TempArtifact`] inside the returned [`ResolvedImage`], so it is removed
//! when the run is over or as soon as a later step fails.
use crate::answers::Architecture;
use crate::error::{ProvisionError, Result};
use crate::progress::{Progress, Stage};
use crate::recovery::TempArtifact;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use xz2::read::XzDecoder;

pub const DEFAULT_BASE_URL: &str = "https://downloads.raspberrypi.org";
pub const BASE_URL_ENV: &str = "PISTRAP_IMAGE_BASE_URL";

const CHUNK: usize = 4 * 1024 * 1024;
const FALLBACK_ARCHIVE_NAME: &str = "raspios_lite_latest.img.xz";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    Local(PathBuf),
    Remote(Architecture),
}

/// An uncompressed image ready to be written.
#[derive(Debug)]
pub struct ResolvedImage {
    pub path: PathBuf,
    pub size: u64,
    artifacts: Vec<TempArtifact>,
}

impl ResolvedImage {
    /// Files that will be deleted when this value is dropped.
    pub fn artifacts(&self) -> Vec<&Path> {
        self.artifacts.iter().map(|a| a.path()).collect()
    }
}

/// `raspios_lite_arm64_latest` style redirect for the given architecture.
pub fn latest_url(base: &str, architecture: Architecture) -> String {
    format!(
        "{}/raspios_lite_{}_latest",
        base.trim_end_matches('/'),
        architecture.os_suffix()
    )
}

pub struct ImageProvider<'a> {
    base_url: String,
    work_dir: PathBuf,
    running: &'a AtomicBool,
    progress: &'a dyn Progress,
}

impl<'a> ImageProvider<'a> {
    pub fn new(
        base_url: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        running: &'a AtomicBool,
        progress: &'a dyn Progress,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            work_dir: work_dir.into(),
            running,
            progress,
        }
    }

    pub fn resolve(&self, source: &ImageSource) -> Result<ResolvedImage> {
        let resolved = match source {
            ImageSource::Local(path) => self.resolve_local(path)?,
            ImageSource::Remote(arch) => self.resolve_remote(*arch)?,
        };
        log::info!(
            "Image ready: {} ({} bytes)",
            resolved.path.display(),
            resolved.size
        );
        Ok(resolved)
    }

    fn resolve_local(&self, path: &Path) -> Result<ResolvedImage> {
        let name = path.to_string_lossy();
        if name.ends_with(".img.xz") {
            if !path.is_file() {
                return Err(ProvisionError::ImageUnavailable(path.to_path_buf()));
            }
            let mut artifacts = Vec::new();
            let out = self.decompress_beside(path, &mut artifacts)?;
            finish(out, artifacts)
        } else if name.ends_with(".img") {
            finish(path.to_path_buf(), Vec::new())
        } else {
            Err(ProvisionError::InvalidImageFormat(path.to_path_buf()))
        }
    }

    fn resolve_remote(&self, architecture: Architecture) -> Result<ResolvedImage> {
        fs::create_dir_all(&self.work_dir)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .user_agent(concat!("pistrap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProvisionError::DownloadFailed {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })?;

        let url = latest_url(&self.base_url, architecture);
        let mut artifacts = Vec::new();
        let (final_url, archive) = self.download(&client, &url, &mut artifacts)?;

        let checksum_url = format!("{final_url}.sha256");
        let checksum_path = artifact_path(&archive, ".sha256");
        artifacts.push(TempArtifact::new(&checksum_path));
        let checksum_text = fetch_text(&client, &checksum_url)?;
        fs::write(&checksum_path, &checksum_text)?;
        let (expected, recorded_name) = parse_checksum(&checksum_url, &checksum_text)?;

        // Compare against the bytes under the name the checksum was published for.
        let mut archive = archive;
        if let Some(recorded) = recorded_name {
            if archive.file_name().and_then(|n| n.to_str()) != Some(recorded.as_str()) {
                let renamed = self.work_dir.join(&recorded);
                log::info!(
                    "Renaming {} to {}",
                    archive.display(),
                    renamed.display()
                );
                if let Some(artifact) = artifacts.iter_mut().find(|a| a.path() == archive) {
                    artifact.rename(&renamed)?;
                }
                archive = renamed;
            }
        }

        verify_sha256(&archive, &expected)?;
        log::info!("Checksum verified for {}", archive.display());

        let name = archive.to_string_lossy().to_string();
        if name.ends_with(".xz") {
            let out = self.decompress_beside(&archive, &mut artifacts)?;
            finish(out, artifacts)
        } else if name.ends_with(".img") {
            finish(archive, artifacts)
        } else {
            Err(ProvisionError::InvalidImageFormat(archive))
        }
    }

    /// Streams `url` into the work directory under the name the server
    /// redirected to. Returns the final URL and the file written.
    fn download(
        &self,
        client: &reqwest::blocking::Client,
        url: &str,
        artifacts: &mut Vec<TempArtifact>,
    ) -> Result<(String, PathBuf)> {
        let failed = |reason: String| ProvisionError::DownloadFailed {
            url: url.to_string(),
            reason,
        };
        log::info!("Downloading {url}");
        let mut response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| failed(e.to_string()))?;

        let final_url = response.url().to_string();
        let file_name = response
            .url()
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or(FALLBACK_ARCHIVE_NAME)
            .to_string();
        let dest = self.work_dir.join(&file_name);
        artifacts.push(TempArtifact::new(&dest));

        let total = response.content_length();
        self.progress.begin(Stage::Download, total);
        let mut out = BufWriter::new(File::create(&dest)?);
        let mut buf = vec![0u8; 64 * 1024];
        let mut done: u64 = 0;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(ProvisionError::cancelled());
            }
            let n = response.read(&mut buf).map_err(|e| failed(e.to_string()))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            done += n as u64;
            self.progress.update(Stage::Download, done);
        }
        out.flush()?;
        self.progress.finish(Stage::Download);

        if let Some(expected) = total {
            if expected != done {
                return Err(failed(format!("received {done} of {expected} bytes")));
            }
        }
        log::info!("Downloaded {} ({} bytes)", dest.display(), done);
        Ok((final_url, dest))
    }

    /// Decompresses `archive` to the same path without its `.xz` suffix. If
    /// that name is already taken, a fresh hidden name in the same directory
    /// is used instead; an existing file is never overwritten or adopted.
    fn decompress_beside(
        &self,
        archive: &Path,
        artifacts: &mut Vec<TempArtifact>,
    ) -> Result<PathBuf> {
        let stripped = archive.with_extension("");
        let out = if stripped.exists() {
            let parent = archive
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let (_, path) = tempfile::Builder::new()
                .prefix(".pistrap-")
                .suffix(".img")
                .tempfile_in(parent)?
                .keep()
                .map_err(|e| ProvisionError::Io(e.error))?;
            log::info!(
                "{} already exists; decompressing to {} instead",
                stripped.display(),
                path.display()
            );
            path
        } else {
            stripped
        };
        artifacts.push(TempArtifact::new(&out));
        decompress_xz(archive, &out, self.running, self.progress)?;
        Ok(out)
    }
}

fn finish(path: PathBuf, artifacts: Vec<TempArtifact>) -> Result<ResolvedImage> {
    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(ProvisionError::ImageUnavailable(path));
    }
    Ok(ResolvedImage {
        path,
        size,
        artifacts,
    })
}

fn artifact_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn fetch_text(client: &reqwest::blocking::Client, url: &str) -> Result<String> {
    client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| ProvisionError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

/// Parses `<hex digest>  <file name>` as written by `sha256sum`. The name is
/// optional and a binary-mode `*` prefix is dropped.
pub fn parse_checksum(url: &str, text: &str) -> Result<(String, Option<String>)> {
    let malformed = || ProvisionError::DownloadFailed {
        url: url.to_string(),
        reason: "checksum file is malformed".into(),
    };
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(malformed)?;
    let mut fields = line.split_whitespace();
    let digest = fields.next().ok_or_else(malformed)?.to_ascii_lowercase();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(malformed());
    }
    let name = fields
        .next()
        .map(|n| n.trim_start_matches('*'))
        .and_then(|n| Path::new(n).file_name())
        .map(|n| n.to_string_lossy().to_string());
    Ok((digest, name))
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut file = BufReader::new(File::open(path)?);
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected {
        log::error!("Checksum mismatch for {}", path.display());
        return Err(ProvisionError::IntegrityCheckFailed {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Counts bytes pulled through it so progress can follow the compressed input.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Streams `input` through an xz decoder into `output`. Progress is reported
/// in compressed bytes consumed against the archive size.
pub fn decompress_xz(
    input: &Path,
    output: &Path,
    running: &AtomicBool,
    progress: &dyn Progress,
) -> Result<u64> {
    let failed = |reason: String| ProvisionError::DecompressionFailed {
        path: input.to_path_buf(),
        reason,
    };
    let source = File::open(input).map_err(|e| failed(e.to_string()))?;
    let compressed_len = source.metadata().map(|m| m.len()).ok();
    let mut decoder = XzDecoder::new_multi_decoder(CountingReader {
        inner: BufReader::new(source),
        count: 0,
    });
    let mut sink = BufWriter::new(File::create(output).map_err(|e| failed(e.to_string()))?);

    log::info!("Decompressing {} to {}", input.display(), output.display());
    progress.begin(Stage::Decompress, compressed_len);
    let mut buf = vec![0u8; CHUNK];
    let mut written: u64 = 0;
    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(ProvisionError::cancelled());
        }
        let n = decoder.read(&mut buf).map_err(|e| failed(e.to_string()))?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])
            .map_err(|e| failed(format!("writing {}: {e}", output.display())))?;
        written += n as u64;
        progress.update(Stage::Decompress, decoder.get_ref().count);
    }
    sink.flush().map_err(|e| failed(e.to_string()))?;
    progress.finish(Stage::Decompress);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use httpmock::prelude::*;
    use tempfile::tempdir;
    use xz2::write::XzEncoder;

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut enc = XzEncoder::new(Vec::new(), 6);
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn payload() -> Vec<u8> {
        (0..300_000u32).map(|i| (i % 97) as u8).collect()
    }

    fn digest(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    #[test]
    fn rejects_unknown_extensions() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("os.zip");
        fs::write(&path, b"x").unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(DEFAULT_BASE_URL, tmp.path(), &running, &NoProgress);
        assert!(matches!(
            provider.resolve(&ImageSource::Local(path)),
            Err(ProvisionError::InvalidImageFormat(_))
        ));
    }

    #[test]
    fn plain_local_image_is_used_in_place_and_kept() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("os.img");
        fs::write(&path, b"bootable").unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(DEFAULT_BASE_URL, tmp.path(), &running, &NoProgress);
        let resolved = provider.resolve(&ImageSource::Local(path.clone())).unwrap();
        assert_eq!(resolved.path, path);
        assert_eq!(resolved.size, 8);
        assert!(resolved.artifacts().is_empty());
        drop(resolved);
        assert!(path.exists());
    }

    #[test]
    fn empty_or_missing_local_image_is_unavailable() {
        let tmp = tempdir().unwrap();
        let empty = tmp.path().join("empty.img");
        fs::write(&empty, b"").unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(DEFAULT_BASE_URL, tmp.path(), &running, &NoProgress);
        assert!(matches!(
            provider.resolve(&ImageSource::Local(empty)),
            Err(ProvisionError::ImageUnavailable(_))
        ));
        assert!(matches!(
            provider.resolve(&ImageSource::Local(tmp.path().join("gone.img.xz"))),
            Err(ProvisionError::ImageUnavailable(_))
        ));
    }

    #[test]
    fn local_archive_decompresses_beside_itself() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("raspios.img.xz");
        fs::write(&archive, xz(&payload())).unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(DEFAULT_BASE_URL, tmp.path(), &running, &NoProgress);

        let resolved = provider.resolve(&ImageSource::Local(archive.clone())).unwrap();
        let out = tmp.path().join("raspios.img");
        assert_eq!(resolved.path, out);
        assert_eq!(fs::read(&out).unwrap(), payload());
        drop(resolved);
        assert!(!out.exists());
        assert!(archive.exists());
    }

    #[test]
    fn existing_image_beside_archive_is_left_untouched() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("raspios.img.xz");
        fs::write(&archive, xz(&payload())).unwrap();
        let mine = tmp.path().join("raspios.img");
        fs::write(&mine, b"operator's own image").unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(DEFAULT_BASE_URL, tmp.path(), &running, &NoProgress);

        let resolved = provider.resolve(&ImageSource::Local(archive)).unwrap();
        assert_ne!(resolved.path, mine);
        assert_eq!(resolved.path.parent(), Some(tmp.path()));
        assert_eq!(fs::read(&resolved.path).unwrap(), payload());
        assert_eq!(resolved.artifacts(), vec![resolved.path.as_path()]);

        let decompressed = resolved.path.clone();
        drop(resolved);
        assert!(!decompressed.exists());
        assert_eq!(fs::read(&mine).unwrap(), b"operator's own image");
    }

    #[test]
    fn corrupt_archive_fails_and_leaves_nothing_behind() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("bad.img.xz");
        fs::write(&archive, b"definitely not xz").unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(DEFAULT_BASE_URL, tmp.path(), &running, &NoProgress);
        assert!(matches!(
            provider.resolve(&ImageSource::Local(archive)),
            Err(ProvisionError::DecompressionFailed { .. })
        ));
        assert!(!tmp.path().join("bad.img").exists());
    }

    #[test]
    fn checksum_lines() {
        let hex = "a".repeat(64);
        let (d, n) = parse_checksum("u", &format!("{hex}  2024-raspios.img.xz\n")).unwrap();
        assert_eq!(d, hex);
        assert_eq!(n.as_deref(), Some("2024-raspios.img.xz"));

        let (_, n) = parse_checksum("u", &format!("{hex} *x.img.xz")).unwrap();
        assert_eq!(n.as_deref(), Some("x.img.xz"));

        let (_, n) = parse_checksum("u", &hex.to_uppercase()).unwrap();
        assert_eq!(n, None);

        assert!(parse_checksum("u", "").is_err());
        assert!(parse_checksum("u", "nothex  x.img.xz").is_err());
    }

    #[test]
    fn remote_image_follows_redirect_and_verifies() {
        let server = MockServer::start();
        let archive = xz(&payload());
        let published = "2024-11-19-raspios-bookworm-arm64-lite.img.xz";

        server.mock(|when, then| {
            when.method(GET).path("/raspios_lite_arm64_latest");
            then.status(302)
                .header("Location", server.url(format!("/images/{published}")));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/images/{published}"));
            then.status(200).body(archive.clone());
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/images/{published}.sha256"));
            then.status(200)
                .body(format!("{}  {}\n", digest(&archive), published));
        });

        let work = tempdir().unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(server.base_url(), work.path(), &running, &NoProgress);
        let resolved = provider
            .resolve(&ImageSource::Remote(Architecture::Bits64))
            .unwrap();

        assert_eq!(
            resolved.path,
            work.path().join("2024-11-19-raspios-bookworm-arm64-lite.img")
        );
        assert_eq!(fs::read(&resolved.path).unwrap(), payload());
        assert_eq!(resolved.artifacts().len(), 3);
        drop(resolved);
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn archive_is_renamed_to_the_checksummed_name() {
        let server = MockServer::start();
        let archive = xz(&payload());
        server.mock(|when, then| {
            when.method(GET).path("/raspios_lite_armhf_latest");
            then.status(200).body(archive.clone());
        });
        server.mock(|when, then| {
            when.method(GET).path("/raspios_lite_armhf_latest.sha256");
            then.status(200)
                .body(format!("{}  raspios-armhf-lite.img.xz\n", digest(&archive)));
        });

        let work = tempdir().unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(server.base_url(), work.path(), &running, &NoProgress);
        let resolved = provider
            .resolve(&ImageSource::Remote(Architecture::Bits32))
            .unwrap();
        assert_eq!(resolved.path, work.path().join("raspios-armhf-lite.img"));
        assert!(work.path().join("raspios-armhf-lite.img.xz").exists());
        assert!(!work.path().join("raspios_lite_armhf_latest").exists());
    }

    #[test]
    fn checksum_mismatch_removes_downloads() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/raspios_lite_arm64_latest");
            then.status(200).body(xz(b"tampered"));
        });
        server.mock(|when, then| {
            when.method(GET).path("/raspios_lite_arm64_latest.sha256");
            then.status(200).body(format!("{}  raspios_lite_arm64_latest\n", "0".repeat(64)));
        });

        let work = tempdir().unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(server.base_url(), work.path(), &running, &NoProgress);
        let err = provider
            .resolve(&ImageSource::Remote(Architecture::Bits64))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::IntegrityCheckFailed { .. }));
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn http_errors_are_download_failures() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/raspios_lite_arm64_latest");
            then.status(404);
        });
        let work = tempdir().unwrap();
        let running = AtomicBool::new(true);
        let provider = ImageProvider::new(server.base_url(), work.path(), &running, &NoProgress);
        assert!(matches!(
            provider.resolve(&ImageSource::Remote(Architecture::Bits64)),
            Err(ProvisionError::DownloadFailed { .. })
        ));
    }
}
