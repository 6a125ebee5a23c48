//! Package archives.
//!
//! A package file (`<full_name>.gem`) is a tar stream, usually gzip
//! compressed, holding a `metadata` entry with the descriptor and the
//! payload under `data/`. The installer only sees the [`Archive`] trait, so
//! other containers (or in-memory fixtures) plug in the same way.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use gemstone_schema::{PlatformTag, Specification, SpecificationError};
use thiserror::Error;
use tracing::{debug, info};

use crate::installer::InstallError;

/// Name of the descriptor entry.
pub const METADATA_ENTRY: &str = "metadata";

/// Prefix of payload entries.
pub const DATA_PREFIX: &str = "data";

/// Extension of package files.
pub const PACKAGE_EXTENSION: &str = "gem";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One payload file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the package root, as stored in the archive.
    pub path: PathBuf,
    /// Unix permission bits.
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// File contents.
    pub data: Vec<u8>,
}

impl FileEntry {
    /// An entry whose size is taken from `data`.
    pub fn new(path: impl Into<PathBuf>, mode: u32, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            path: path.into(),
            mode,
            size: data.len() as u64,
            data,
        }
    }
}

/// Read access to a package container.
pub trait Archive {
    /// The package descriptor.
    fn specification(&self) -> &Specification;

    /// Payload files in archive order.
    fn file_entries(&self) -> &[FileEntry];

    /// The file this archive was read from, if any.
    fn source_path(&self) -> Option<&Path> {
        None
    }
}

/// Errors raised while building a package file.
#[derive(Error, Debug)]
pub enum PackageError {
    /// The specification failed validation.
    #[error(transparent)]
    Specification(#[from] SpecificationError),

    /// A file named by the specification does not exist.
    #[error("missing file {}", .0.display())]
    MissingFile(PathBuf),

    /// Walking the source tree failed.
    #[error("failed to walk {}: {source}", .path.display())]
    Walk {
        /// Directory being walked.
        path: PathBuf,
        /// Underlying error.
        source: walkdir::Error,
    },

    /// Reading sources or writing the package failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An archive held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryArchive {
    spec: Specification,
    entries: Vec<FileEntry>,
}

impl MemoryArchive {
    /// An archive with no payload.
    pub fn new(spec: Specification) -> Self {
        Self {
            spec,
            entries: Vec::new(),
        }
    }

    /// Append a payload file.
    pub fn with_file(
        mut self,
        path: impl Into<PathBuf>,
        mode: u32,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        self.entries.push(FileEntry::new(path, mode, data));
        self
    }

    /// Append a payload entry.
    pub fn push(&mut self, entry: FileEntry) {
        self.entries.push(entry);
    }

    /// Write as a gzip-compressed package file.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor cannot be encoded or the file cannot be
    /// written.
    pub fn write_to(&self, path: &Path) -> Result<(), PackageError> {
        let descriptor = self.spec.to_descriptor()?;

        let file = File::create(path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut tar = tar::Builder::new(encoder);

        append(&mut tar, Path::new(METADATA_ENTRY), 0o444, descriptor.as_bytes())?;
        for entry in &self.entries {
            append(&mut tar, &Path::new(DATA_PREFIX).join(&entry.path), entry.mode, &entry.data)?;
        }

        let encoder = tar.into_inner()?;
        encoder.finish()?.flush()?;
        Ok(())
    }
}

fn append<W: Write>(
    tar: &mut tar::Builder<W>,
    path: &Path,
    mode: u32,
    data: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    tar.append_data(&mut header, path, data)
}

impl Archive for MemoryArchive {
    fn specification(&self) -> &Specification {
        &self.spec
    }

    fn file_entries(&self) -> &[FileEntry] {
        &self.entries
    }
}

/// A package file read from disk.
#[derive(Debug, Clone)]
pub struct PackageArchive {
    path: PathBuf,
    inner: MemoryArchive,
}

impl PackageArchive {
    /// Read and decode a package file.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Format`] if the file is not a readable tar
    /// stream, lacks a `metadata` entry, or carries an invalid descriptor.
    pub fn open(path: &Path) -> Result<Self, InstallError> {
        let invalid =
            || InstallError::Format(format!("invalid package format for {}", path.display()));

        let bytes = std::fs::read(path).map_err(|e| {
            debug!("Failed to read {}: {e}", path.display());
            invalid()
        })?;

        let parsed = if bytes.starts_with(&GZIP_MAGIC) {
            read_entries(GzDecoder::new(bytes.as_slice()))
        } else {
            read_entries(bytes.as_slice())
        };
        let (descriptor, entries) = parsed.map_err(|e| {
            debug!("Corrupt package {}: {e}", path.display());
            invalid()
        })?;

        let Some(descriptor) = descriptor else {
            debug!("{} has no {METADATA_ENTRY} entry", path.display());
            return Err(invalid());
        };
        let spec = Specification::from_descriptor(&descriptor).map_err(|e| {
            debug!("Bad descriptor in {}: {e}", path.display());
            invalid()
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: MemoryArchive { spec, entries },
        })
    }
}

fn read_entries<R: Read>(reader: R) -> std::io::Result<(Option<String>, Vec<FileEntry>)> {
    let mut archive = tar::Archive::new(reader);
    let mut descriptor = None;
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }

        let path = entry.path()?.into_owned();
        let mode = entry.header().mode().unwrap_or(0o644);

        if path == Path::new(METADATA_ENTRY) {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            descriptor = Some(text);
        } else if let Ok(relative) = path.strip_prefix(DATA_PREFIX) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            entries.push(FileEntry::new(relative, mode, data));
        }
    }

    Ok((descriptor, entries))
}

impl Archive for PackageArchive {
    fn specification(&self) -> &Specification {
        self.inner.specification()
    }

    fn file_entries(&self) -> &[FileEntry] {
        self.inner.file_entries()
    }

    fn source_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Builds package files from a source tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageBuilder;

impl PackageBuilder {
    /// Package every file the specification lists, read from `source_dir`,
    /// into `<out_dir>/<full_name>.gem`. Listed directories are included
    /// recursively. A `current` platform is pinned to the host and the
    /// schema version is stamped before writing.
    ///
    /// # Errors
    ///
    /// Fails if the specification is invalid, a listed file is missing, or
    /// the package cannot be written.
    pub fn build(
        spec: &Specification,
        source_dir: &Path,
        out_dir: &Path,
    ) -> Result<PathBuf, PackageError> {
        let mut spec = spec.clone();
        if spec.platform == PlatformTag::Current {
            spec.platform = PlatformTag::Native(gemstone_schema::Platform::local().clone());
        }
        spec.mark_version();
        spec.validate()?;

        let mut archive = MemoryArchive::new(spec);
        for listed in archive.spec.all_files() {
            let full = source_dir.join(&listed);
            if full.is_dir() {
                collect_dir(&mut archive, source_dir, &full)?;
            } else if full.is_file() {
                archive.push(read_entry(source_dir, &full)?);
            } else {
                return Err(PackageError::MissingFile(full));
            }
        }

        std::fs::create_dir_all(out_dir)?;
        let target = out_dir.join(format!("{}.{PACKAGE_EXTENSION}", archive.spec.full_name()));
        archive.write_to(&target)?;

        info!(
            "Built {} ({} files)",
            target.display(),
            archive.file_entries().len()
        );
        Ok(target)
    }
}

fn collect_dir(
    archive: &mut MemoryArchive,
    source_dir: &Path,
    dir: &Path,
) -> Result<(), PackageError> {
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|source| PackageError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file() {
            archive.push(read_entry(source_dir, entry.path())?);
        }
    }
    Ok(())
}

fn read_entry(source_dir: &Path, path: &Path) -> Result<FileEntry, PackageError> {
    let data = std::fs::read(path)?;
    let relative = path.strip_prefix(source_dir).unwrap_or(path);
    Ok(FileEntry::new(relative, file_mode(path)?, data))
}

#[cfg(unix)]
fn file_mode(path: &Path) -> std::io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> std::io::Result<u32> {
    Ok(0o644)
}
