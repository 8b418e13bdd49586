use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while scanning a seeds directory.
#[derive(Error, Debug)]
pub enum SeedError {
    /// The seeds directory does not exist or is not a directory.
    #[error("Seeds directory {0:?} does not exist or is not a directory")]
    NotADirectory(PathBuf),

    /// An I/O error occurred while listing or reading seed files.
    #[error("Seeds I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No subdirectory of the seeds directory holds any sample file.
    #[error("Seeds directory {0:?} contains no non-empty file-type bucket")]
    NoBuckets(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SeedError + '_ {
    move |source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A directory of sample files presumed to share one file type.
///
/// The label is the directory name up to its first `_`, so `pdf_samples`
/// and `pdf` both describe the `pdf` type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTypeBucket {
    pub label: String,
    pub path: PathBuf,
    /// Sample files in name order.
    pub files: Vec<PathBuf>,
}

impl FileTypeBucket {
    /// Scans `path` for regular, non-hidden files. Returns `Ok(None)` for an
    /// empty bucket.
    pub fn scan(path: &Path) -> Result<Option<Self>, SeedError> {
        let dir_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return Ok(None),
        };
        let mut files = Vec::new();
        for entry in fs::read_dir(path).map_err(io_err(path))? {
            let entry = entry.map_err(io_err(path))?;
            let file_path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if file_path.is_file() && !hidden {
                files.push(file_path);
            }
        }
        if files.is_empty() {
            return Ok(None);
        }
        files.sort();
        Ok(Some(Self {
            label: label_for_dir_name(dir_name),
            path: path.to_path_buf(),
            files,
        }))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Picks up to `count` representative samples: first files in name order
    /// whose contents have not been seen yet.
    pub fn representative_samples(&self, count: usize) -> Result<Vec<PathBuf>, SeedError> {
        let mut seen = HashSet::new();
        let mut picked = Vec::with_capacity(count);
        for file in &self.files {
            if picked.len() >= count {
                break;
            }
            let digest = md5::compute(fs::read(file).map_err(io_err(file))?);
            if seen.insert(digest.0) {
                picked.push(file.clone());
            }
        }
        Ok(picked)
    }
}

pub fn label_for_dir_name(dir_name: &str) -> String {
    dir_name.split('_').next().unwrap_or(dir_name).to_string()
}

/// The caller-supplied seeds directory, one bucket per file type.
#[derive(Debug, Clone)]
pub struct SeedCorpus {
    /// Non-empty buckets ordered by directory name.
    pub buckets: Vec<FileTypeBucket>,
}

impl SeedCorpus {
    /// Loads every non-empty, non-hidden bucket below `root`.
    ///
    /// # Errors
    /// [`SeedError::NotADirectory`] when `root` is missing,
    /// [`SeedError::NoBuckets`] when no bucket holds a sample.
    pub fn load(root: &Path) -> Result<Self, SeedError> {
        if !root.is_dir() {
            return Err(SeedError::NotADirectory(root.to_path_buf()));
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(root).map_err(io_err(root))? {
            let entry = entry.map_err(io_err(root))?;
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if path.is_dir() && !hidden {
                dirs.push(path);
            }
        }
        dirs.sort();

        let mut buckets = Vec::new();
        for dir in dirs {
            if let Some(bucket) = FileTypeBucket::scan(&dir)? {
                buckets.push(bucket);
            }
        }
        if buckets.is_empty() {
            return Err(SeedError::NoBuckets(root.to_path_buf()));
        }
        Ok(Self {
            buckets,
        })
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::fs;
    use std::path::Path;

    /// Creates `root/<dir>/sample_<i>` files with distinct contents.
    pub fn write_bucket(root: &Path, dir: &str, count: usize) {
        let bucket = root.join(dir);
        fs::create_dir_all(&bucket).unwrap();
        for i in 0..count {
            fs::write(bucket.join(format!("sample_{i}")), format!("{dir} sample {i}")).unwrap();
        }
    }
}
