//! File metadata cache.
//!
//! Source files are looked up on every eligible response, so their
//! `(is_file, mtime, size)` triple is cached per path for a configurable
//! validity window. Symlink policy is enforced before the file is stat'ed,
//! and failures come back as typed [`LookupError`]s.

use crate::config::SymlinkPolicy;
use dashmap::DashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Attributes of a resolved source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFileAttributes {
    /// Whether the path is a regular file
    pub is_file: bool,
    /// Modification time (unix seconds)
    pub mtime: i64,
    /// Size in bytes; `None` when unknown
    pub size: Option<u64>,
}

/// Per-scope lookup parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupHints {
    /// How long a cached result may be reused. Zero disables caching.
    pub valid: Duration,
    /// Whether failed lookups are cached
    pub cache_errors: bool,
    /// Symlink policy
    pub symlinks: SymlinkPolicy,
}

impl Default for LookupHints {
    fn default() -> Self {
        Self {
            valid: Duration::from_secs(60),
            cache_errors: false,
            symlinks: SymlinkPolicy::Off,
        }
    }
}

/// Cached, symlink-aware file metadata lookups.
///
/// Implementations are shared across requests and must synchronize internally.
pub trait FileMetadataCache: Send + Sync {
    /// Resolve `path` to its attributes.
    fn lookup(&self, path: &Path, hints: &LookupHints)
        -> Result<SourceFileAttributes, LookupError>;
}

/// Why a lookup failed.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("symlink policy forbids {}", path.display())]
    SymlinkPolicy { path: PathBuf },

    #[error("could not open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not stat {}: {source}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// `DashMap`-backed [`FileMetadataCache`].
pub struct OpenFileCache {
    /// Cache entries (path -> lookup result)
    entries: DashMap<PathBuf, CachedLookup>,
    /// Maximum number of entries
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone)]
struct CachedLookup {
    result: Result<SourceFileAttributes, CachedError>,
    symlinks: SymlinkPolicy,
    cached_at: Instant,
}

/// Failed lookup kept in the cache. `io::Error` is not `Clone`, so only its kind is kept.
#[derive(Debug, Clone, Copy)]
enum CachedError {
    SymlinkPolicy,
    Open(io::ErrorKind),
    Stat(io::ErrorKind),
}

impl CachedError {
    fn from_error(error: &LookupError) -> Self {
        match error {
            LookupError::SymlinkPolicy { .. } => Self::SymlinkPolicy,
            LookupError::Open { source, .. } => Self::Open(source.kind()),
            LookupError::Stat { source, .. } => Self::Stat(source.kind()),
        }
    }

    fn into_error(self, path: &Path) -> LookupError {
        let path = path.to_path_buf();
        match self {
            Self::SymlinkPolicy => LookupError::SymlinkPolicy { path },
            Self::Open(kind) => LookupError::Open {
                path,
                source: io::Error::from(kind),
            },
            Self::Stat(kind) => LookupError::Stat {
                path,
                source: io::Error::from(kind),
            },
        }
    }
}

impl OpenFileCache {
    /// Create a cache holding at most `max_entries` paths.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(max_entries.min(1024)),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn cached(&self, path: &Path, hints: &LookupHints) -> Option<CachedLookup> {
        let entry = self.entries.get(path)?;
        let usable = entry.symlinks == hints.symlinks
            && entry.cached_at.elapsed() < hints.valid
            && (entry.result.is_ok() || hints.cache_errors);
        usable.then(|| entry.value().clone())
    }

    /// Make room for one entry: drop everything older than `valid`, and only
    /// if nothing expired, the single oldest entry.
    fn make_room(&self, valid: Duration) {
        self.entries.retain(|_, entry| entry.cached_at.elapsed() < valid);
        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.cached_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl Default for OpenFileCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl FileMetadataCache for OpenFileCache {
    fn lookup(
        &self,
        path: &Path,
        hints: &LookupHints,
    ) -> Result<SourceFileAttributes, LookupError> {
        if hints.valid.is_zero() {
            return stat_source(path, hints.symlinks);
        }

        if let Some(entry) = self.cached(path, hints) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(path = %path.display(), "open file cache hit");
            return entry.result.map_err(|e| e.into_error(path));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = stat_source(path, hints.symlinks);

        let cacheable = match &result {
            Ok(attrs) => Some(Ok(*attrs)),
            Err(e) if hints.cache_errors => Some(Err(CachedError::from_error(e))),
            Err(_) => None,
        };

        if let Some(cached) = cacheable {
            if self.entries.len() >= self.max_entries && !self.entries.contains_key(path) {
                self.make_room(hints.valid);
            }
            self.entries.insert(
                path.to_path_buf(),
                CachedLookup {
                    result: cached,
                    symlinks: hints.symlinks,
                    cached_at: Instant::now(),
                },
            );
        } else {
            self.entries.remove(path);
        }

        result
    }
}

/// Resolve a path without caching.
pub fn stat_source(
    path: &Path,
    symlinks: SymlinkPolicy,
) -> Result<SourceFileAttributes, LookupError> {
    check_symlinks(path, symlinks)?;

    let stat_error = |source| LookupError::Stat {
        path: path.to_path_buf(),
        source,
    };

    let metadata = fs::metadata(path).map_err(stat_error)?;
    if !metadata.is_file() {
        return Ok(SourceFileAttributes {
            is_file: false,
            mtime: unix_mtime(metadata.modified().map_err(stat_error)?),
            size: None,
        });
    }

    let file = File::open(path).map_err(|source| LookupError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let metadata = file.metadata().map_err(stat_error)?;

    Ok(SourceFileAttributes {
        is_file: metadata.is_file(),
        mtime: unix_mtime(metadata.modified().map_err(stat_error)?),
        size: metadata.is_file().then_some(metadata.len()),
    })
}

fn unix_mtime(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

/// Walk every component of `path` and apply the symlink policy.
///
/// Components that cannot be inspected are skipped; the stat that follows
/// reports them.
fn check_symlinks(path: &Path, policy: SymlinkPolicy) -> Result<(), LookupError> {
    if policy == SymlinkPolicy::Off {
        return Ok(());
    }

    let mut components: Vec<&Path> = path
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty() && p.parent().is_some())
        .collect();
    components.reverse();

    for component in components {
        let Ok(link) = fs::symlink_metadata(component) else {
            break;
        };
        if !link.file_type().is_symlink() {
            continue;
        }
        if policy == SymlinkPolicy::IfNotOwner && same_owner(component, &link) {
            continue;
        }
        return Err(LookupError::SymlinkPolicy {
            path: component.to_path_buf(),
        });
    }

    Ok(())
}

#[cfg(unix)]
fn same_owner(link_path: &Path, link: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;

    fs::metadata(link_path).is_ok_and(|target| target.uid() == link.uid())
}

#[cfg(not(unix))]
fn same_owner(_link_path: &Path, _link: &fs::Metadata) -> bool {
    false
}
