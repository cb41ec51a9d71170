//! File transfer over the remote-exec channel
//!
//! Bytes move between the local machine and a pod as tar streams over the
//! exec channel's stdin/stdout.
//!
//! Upload frames one local file as a single-entry tar archive (header,
//! content in fixed 4 MiB chunks, padding, end-of-archive blocks) written
//! by a producer thread into the stdin pipe of `tar -xf - -C <destdir>`
//! running in the target container. The pipe blocks the producer whenever
//! the remote side lags, so memory stays constant regardless of file size.
//!
//! Download first classifies the remote path. A single file is streamed
//! with `cat` into a `.download` staging file, verified against the remote
//! `stat` size, and only then renamed into place, so callers never observe
//! a partial artifact under the final name. A directory is pulled as one
//! `tar -cf -` stream into a local temporary archive and replayed entry by
//! entry.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::cluster::{Cluster, ClusterError, ExecOutput, ExecTarget, InputProducer};
use crate::progress::{CountingWriter, ProgressMeter};

/// Upload chunk size: the tar producer writes file content in frames of
/// this many bytes.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Buffer size for the single-file download writer.
pub const DOWNLOAD_BUFFER_SIZE: usize = 8 * 1024 * 1024;

const TAR_BLOCK_SIZE: u64 = 512;
const TAR_ZERO_BLOCK: [u8; TAR_BLOCK_SIZE as usize] = [0u8; TAR_BLOCK_SIZE as usize];

/// Transfer errors. Remote failures carry the captured stderr text.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("remote command `{command}` failed: {stderr}")]
    Remote { command: String, stderr: String },

    #[error("path {0} does not exist on the pod")]
    NotFound(String),

    #[error("unexpected path classification {output:?} for {path}")]
    Classify { path: String, output: String },

    #[error("could not parse remote size {output:?} for {path}")]
    BadSize { path: String, output: String },

    #[error("incomplete download of {path}: expected {expected} bytes, got {actual}")]
    Incomplete {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("remote path {0} has no file name")]
    NoFileName(String),
}

/// Kind of a remote path, as reported by the classification probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePathKind {
    File,
    Directory,
}

/// Statistics from one chunked copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub bytes: u64,
    pub chunks: u64,
}

/// One transfer session against a single pod/container.
pub struct TransferSession<'a> {
    cluster: &'a dyn Cluster,
    target: ExecTarget,
}

impl<'a> TransferSession<'a> {
    pub fn new(cluster: &'a dyn Cluster, target: ExecTarget) -> Self {
        Self { cluster, target }
    }

    /// Upload one local file into a remote directory.
    ///
    /// Returns the number of content bytes streamed.
    pub fn upload(&self, local: &Path, remote_dir: &str) -> Result<u64, TransferError> {
        let output = self
            .cluster
            .run(&self.target, &["mkdir", "-p", remote_dir])?;
        check_remote(&output, &format!("mkdir -p {remote_dir}"))?;

        let file = File::open(local)?;
        let metadata = file.metadata()?;
        let size = metadata.len();
        let file_name = local
            .file_name()
            .ok_or_else(|| TransferError::NoFileName(local.display().to_string()))?
            .to_string_lossy()
            .into_owned();

        let mut header = tar::Header::new_gnu();
        header.set_path(&file_name)?;
        header.set_size(size);
        header.set_mode(file_mode(&metadata));
        header.set_mtime(
            metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();

        let producer: InputProducer = Box::new(move |w: &mut dyn Write| {
            let mut meter = ProgressMeter::new();
            let mut out = CountingWriter::new(w, |n| meter.record(n));
            write_tar_entry(&header, file, size, &mut out)?;
            out.flush()?;
            meter.finish();
            Ok(())
        });

        let command = ["tar", "-xf", "-", "-C", remote_dir];
        let output = self
            .cluster
            .run_with_input(&self.target, &command, producer)?;
        check_remote(&output, &command.join(" "))?;

        Ok(size)
    }

    /// Download a remote file or directory into a local directory.
    ///
    /// Returns the path of the downloaded file, or of the local directory
    /// for a directory download.
    pub fn download(&self, remote: &str, local_dir: &Path) -> Result<PathBuf, TransferError> {
        match self.classify(remote)? {
            RemotePathKind::File => self.download_file(remote, local_dir),
            RemotePathKind::Directory => self.download_dir(remote, local_dir),
        }
    }

    /// Probe a remote path; `notfound` is fatal for the operation.
    pub fn classify(&self, remote: &str) -> Result<RemotePathKind, TransferError> {
        let script = classify_script(remote);
        let output = self.cluster.run(&self.target, &["sh", "-c", &script])?;
        check_remote(&output, "remote path check")?;
        match output.stdout_text().as_str() {
            "directory" => Ok(RemotePathKind::Directory),
            "file" => Ok(RemotePathKind::File),
            "notfound" => Err(TransferError::NotFound(remote.to_string())),
            other => Err(TransferError::Classify {
                path: remote.to_string(),
                output: other.to_string(),
            }),
        }
    }

    /// Remote file size via `stat`.
    fn remote_size(&self, remote: &str) -> Result<u64, TransferError> {
        let output = self
            .cluster
            .run(&self.target, &["stat", "-c", "%s", remote])?;
        check_remote(&output, &format!("stat {remote}"))?;
        let text = output.stdout_text();
        text.parse().map_err(|_| TransferError::BadSize {
            path: remote.to_string(),
            output: text,
        })
    }

    fn download_file(&self, remote: &str, local_dir: &Path) -> Result<PathBuf, TransferError> {
        let expected = self.remote_size(remote)?;

        let file_name = Path::new(remote)
            .file_name()
            .ok_or_else(|| TransferError::NoFileName(remote.to_string()))?
            .to_string_lossy()
            .into_owned();
        fs::create_dir_all(local_dir)?;
        let final_path = local_dir.join(&file_name);
        let staging_path = local_dir.join(format!("{file_name}.download"));

        let staging = RemoveOnDrop::new(staging_path.clone());
        let mut meter = ProgressMeter::new();
        let output = {
            let file = File::create(&staging_path)?;
            let buffered = BufWriter::with_capacity(DOWNLOAD_BUFFER_SIZE, file);
            let mut sink = CountingWriter::new(buffered, |n| meter.record(n));
            let output = self
                .cluster
                .run_with_output(&self.target, &["cat", remote], &mut sink)?;
            sink.into_inner()
                .into_inner()
                .map_err(|e| e.into_error())?;
            output
        };
        check_remote(&output, &format!("cat {remote}"))?;
        meter.finish();

        let actual = fs::metadata(&staging_path)?.len();
        if actual != expected {
            return Err(TransferError::Incomplete {
                path: remote.to_string(),
                expected,
                actual,
            });
        }

        fs::rename(&staging_path, &final_path)?;
        staging.disarm();
        Ok(final_path)
    }

    fn download_dir(&self, remote: &str, local_dir: &Path) -> Result<PathBuf, TransferError> {
        fs::create_dir_all(local_dir)?;

        // Stage the archive next to its destination; the guard removes it
        // on success and failure alike.
        let archive = tempfile::Builder::new()
            .prefix(".podbuild-")
            .suffix(".tar")
            .tempfile_in(local_dir)?;

        let mut meter = ProgressMeter::new();
        let command = ["tar", "-cf", "-", "-C", remote, "."];
        let output = {
            let mut sink = CountingWriter::new(archive.as_file(), |n| meter.record(n));
            self.cluster
                .run_with_output(&self.target, &command, &mut sink)?
        };
        check_remote(&output, &command.join(" "))?;
        meter.finish();

        let reader = archive.reopen()?;
        replay_archive(reader, local_dir)?;
        Ok(local_dir.to_path_buf())
    }
}

/// Shell probe reporting `directory`, `file`, or `notfound` for a path.
pub(crate) fn classify_script(path: &str) -> String {
    format!(
        "if [ -d '{path}' ]; then echo directory; elif [ -f '{path}' ]; then echo file; else echo notfound; fi"
    )
}

fn check_remote(output: &ExecOutput, command: &str) -> Result<(), TransferError> {
    if output.success {
        return Ok(());
    }
    Err(TransferError::Remote {
        command: command.to_string(),
        stderr: output.stderr.clone(),
    })
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

/// Write one complete single-entry tar stream: header, content in
/// [`CHUNK_SIZE`] frames, padding to the block boundary, and the two
/// zero blocks that terminate an archive.
fn write_tar_entry<R: Read>(
    header: &tar::Header,
    mut content: R,
    size: u64,
    writer: &mut dyn Write,
) -> io::Result<()> {
    writer.write_all(header.as_bytes())?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let stats = copy_chunked(&mut content, writer, &mut buf)?;
    if stats.bytes != size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "file size changed during upload: header says {size}, read {}",
                stats.bytes
            ),
        ));
    }

    let padding = (TAR_BLOCK_SIZE - (size % TAR_BLOCK_SIZE)) % TAR_BLOCK_SIZE;
    writer.write_all(&TAR_ZERO_BLOCK[..padding as usize])?;
    writer.write_all(&TAR_ZERO_BLOCK)?;
    writer.write_all(&TAR_ZERO_BLOCK)?;
    Ok(())
}

/// Copy `reader` to `writer` through `buf`, filling the buffer completely
/// before each write so every frame but the last is exactly `buf.len()`
/// bytes.
pub(crate) fn copy_chunked<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
) -> io::Result<ChunkStats> {
    let mut stats = ChunkStats::default();
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled == 0 {
            break;
        }
        writer.write_all(&buf[..filled])?;
        stats.bytes += filled as u64;
        stats.chunks += 1;
        if filled < buf.len() {
            break;
        }
    }
    Ok(stats)
}

/// Replay a directory archive into `dest`.
///
/// Entries are handled strictly in archive order. Each file entry gets a
/// defensive parent `create_dir_all`, so extraction does not depend on the
/// remote archiver emitting directories before their children. Entries
/// with absolute or parent-traversal paths, and entry types other than
/// directory, regular file, or symlink, are skipped.
fn replay_archive<R: Read>(reader: R, dest: &Path) -> Result<(), TransferError> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let Some(rel) = sanitize_entry_path(&raw_path) else {
            continue;
        };
        let target = dest.join(&rel);
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
        } else if entry_type.is_symlink() {
            if let Some(link) = entry.link_name()? {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                make_symlink(&link, &target)?;
            }
        }
        // Other entry types (devices, fifos, hard links) are skipped.
    }
    Ok(())
}

/// Normalize an archive entry path to a safe relative path, or `None` for
/// the archive root and for entries that would escape the destination.
fn sanitize_entry_path(raw: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            // Absolute or traversing entries are not extracted.
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    if target.symlink_metadata().is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, _target: &Path) -> io::Result<()> {
    // Symlink entries are skipped on platforms without them.
    Ok(())
}

/// Removes a staging path on drop unless disarmed after a verified rename.
struct RemoveOnDrop {
    path: PathBuf,
    armed: bool,
}

impl RemoveOnDrop {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}
