use std::{
    collections::{BTreeMap, HashSet},
    fs::{DirBuilder, File, OpenOptions, read_dir},
    io::{self, Read as _, Write as _},
    os::unix::fs::DirBuilderExt as _,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use jiff::civil::DateTime;
use log::{debug, info, trace, warn};
use thiserror::Error;
use zip::{CompressionMethod, ZipArchive, ZipWriter, result::ZipError, write::SimpleFileOptions};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("broken archive {path}: {source}")]
    Zip { path: PathBuf, source: ZipError },
}

/// Messages without a usable date go into the bundle of this month.
const UNKNOWN_BUCKET: (i16, i8) = (1970, 1);

/// One message on its way into a bundle.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    index: u32,
    date: Option<DateTime>,
    content: Bytes,
}

impl ArchiveEntry {
    pub fn new(index: u32, date: Option<DateTime>, content: Bytes) -> Self {
        Self {
            index,
            date,
            content,
        }
    }

    pub fn bundle_name(&self) -> String {
        let (year, month) = self
            .date
            .map_or(UNKNOWN_BUCKET, |date| (date.year(), date.month()));
        format!("emails_{year:04}-{month:02}.zip")
    }

    pub fn name(&self) -> String {
        self.name_with_index(self.index)
    }

    fn name_with_index(&self, index: u32) -> String {
        let date = self.date.map_or_else(
            || "unknown".to_string(),
            |date| date.strftime("%Y%m%d").to_string(),
        );
        format!("msg_{index:06}_{date}.eml")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSummary {
    pub path: PathBuf,
    pub entries: u32,
    pub size: u64,
}

/// The output directory: zip bundles keyed by year and month, only ever
/// appended to.
#[derive(Debug)]
pub struct ArchiveSet {
    dir: PathBuf,
    index_base: u32,
    /// Highest entry index on disk, in any bundle.
    highest: u32,
    written: BTreeMap<String, u32>,
}

impl ArchiveSet {
    /// Opens or creates `dir`. Entry indexes of this run continue after the
    /// highest index already present, so earlier runs are never shadowed.
    pub fn open(dir: &Path) -> Result<Self, ArchiveError> {
        DirBuilder::new().recursive(true).mode(0o700).create(dir)?;

        let mut index_base = 0;
        for dir_entry in read_dir(dir)? {
            let path = dir_entry?.path();
            let is_bundle = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("emails_") && name.ends_with(".zip"));
            if !is_bundle {
                continue;
            }
            for name in entry_names(&path)? {
                if let Some(index) = entry_index(&name) {
                    index_base = index_base.max(index);
                }
            }
        }
        if index_base > 0 {
            info!(
                "{} already holds messages up to #{index_base}, continuing after it",
                dir.display()
            );
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            index_base,
            highest: index_base,
            written: BTreeMap::new(),
        })
    }

    /// Index for the `running`th message of this run, counted from 1.
    pub fn entry_index(&self, running: u32) -> u32 {
        self.index_base.saturating_add(running)
    }

    /// Writes `entries` into their bundles and syncs every touched bundle to
    /// disk. An entry whose name is already stored with the same content is
    /// skipped; one whose name is taken by another message gets a fresh
    /// index. Returns how many were written.
    pub fn append(&mut self, entries: &[ArchiveEntry]) -> Result<u32, ArchiveError> {
        let mut by_bundle: BTreeMap<String, Vec<&ArchiveEntry>> = BTreeMap::new();
        for entry in entries {
            by_bundle.entry(entry.bundle_name()).or_default().push(entry);
        }

        let mut total = 0;
        for (bundle, entries) in by_bundle {
            let path = self.dir.join(&bundle);
            let written = append_to_bundle(&path, &entries, &mut self.highest)?;
            *self.written.entry(bundle).or_default() += written;
            total += written;
        }
        Ok(total)
    }

    /// Bundles touched by this run with the number of entries it added.
    pub fn summary(&self) -> Result<Vec<BundleSummary>, ArchiveError> {
        self.written
            .iter()
            .map(|(bundle, &entries)| {
                let path = self.dir.join(bundle);
                let size = path.metadata()?.len();
                Ok(BundleSummary {
                    path,
                    entries,
                    size,
                })
            })
            .collect()
    }

    pub fn written_paths(&self) -> Vec<PathBuf> {
        self.written.keys().map(|bundle| self.dir.join(bundle)).collect()
    }
}

fn zip_error(path: &Path) -> impl FnOnce(ZipError) -> ArchiveError + '_ {
    |source| ArchiveError::Zip {
        path: path.to_path_buf(),
        source,
    }
}

fn entry_names(path: &Path) -> Result<HashSet<String>, ArchiveError> {
    let file = File::open(path)?;
    let archive = ZipArchive::new(file).map_err(zip_error(path))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

fn entry_index(name: &str) -> Option<u32> {
    name.strip_prefix("msg_")?.split('_').next()?.parse().ok()
}

fn stored_content(
    archive: &mut ZipArchive<File>,
    path: &Path,
    name: &str,
) -> Result<Option<Vec<u8>>, ArchiveError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(zip_error(path)(e)),
    };
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    Ok(Some(content))
}

fn append_to_bundle(
    path: &Path,
    entries: &[&ArchiveEntry],
    highest: &mut u32,
) -> Result<u32, ArchiveError> {
    let exists = path.exists();
    let mut placed = Vec::with_capacity(entries.len());
    {
        let mut reader = if exists {
            Some(ZipArchive::new(File::open(path)?).map_err(zip_error(path))?)
        } else {
            None
        };
        for entry in entries {
            let name = entry.name();
            let stored = match reader.as_mut() {
                Some(reader) => stored_content(reader, path, &name)?,
                None => None,
            };
            match stored {
                Some(stored) if stored == entry.content => {
                    trace!("{name} is already in {}", path.display());
                }
                Some(_) => {
                    *highest += 1;
                    let renamed = entry.name_with_index(*highest);
                    warn!(
                        "{name} in {} holds another message, writing {renamed}",
                        path.display()
                    );
                    placed.push((renamed, &entry.content));
                }
                None => {
                    *highest = (*highest).max(entry.index);
                    placed.push((name, &entry.content));
                }
            }
        }
    }
    if placed.is_empty() {
        return Ok(0);
    }

    let mut writer = if exists {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        ZipWriter::new_append(file).map_err(zip_error(path))?
    } else {
        debug!("creating {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        ZipWriter::new(file)
    };

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut written = 0;
    for (name, content) in placed {
        writer.start_file(name, options).map_err(zip_error(path))?;
        writer.write_all(content)?;
        written += 1;
    }

    let file = writer.finish().map_err(zip_error(path))?;
    file.sync_all()?;
    Ok(written)
}
