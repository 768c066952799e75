//! Per-user quota sampling for XFS-style and Ceph-style filesystems.
//!
//! Every backend produces a [`RawSample`] for one user and one path. The
//! sample is then normalized into a [`QuotaRecord`], which is the same shape
//! no matter where the numbers came from.
//!
//! ```no_run
//! use fs_quota::{parse_targets, Collector, QuotaCmdOptions};
//!
//! let targets = parse_targets(&["/home:xfs", "/public:ceph"]).unwrap();
//! let collector = Collector::standard(QuotaCmdOptions::default());
//! for rec in collector.collect_all(&["alice"], &targets) {
//!     println!("{} {:?}", rec.path.display(), rec.blocks_pct);
//! }
//! ```
#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

mod ceph;
mod quota_cmd;

#[cfg(not(unix))]
mod generic_os;

pub use crate::ceph::{AttrSource, CephReader, XattrSource, CEPH_ATTRS};
pub use crate::quota_cmd::{parse_quota_output, QuotaCmdOptions, QuotaCmdReader};

/// Filesystem flavours we know how to read quota from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    /// Quota reported by the `quota(1)` tool, in 1K blocks.
    Xfs,
    /// Quota stored in extended attributes of a per-user directory.
    Ceph,
}

impl FsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsKind::Xfs => "xfs",
            FsKind::Ceph => "ceph",
        }
    }

    // Ceph has no separate soft limit, so the percentage is taken
    // against the hard limit.
    fn pct_against_hard(&self) -> bool {
        *self == FsKind::Ceph
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsKind {
    type Err = FqError;

    fn from_str(s: &str) -> Result<FsKind, FqError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xfs" => Ok(FsKind::Xfs),
            "ceph" | "cephfs" => Ok(FsKind::Ceph),
            other => Err(FqError::UnknownKind(other.to_string())),
        }
    }
}

/// A `path:kind` pair naming what to measure.
///
/// The kind is kept as written; an unknown kind is not an error until
/// the target is actually collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path:   PathBuf,
    pub fstype: String,
}

impl Target {
    pub fn kind(&self) -> Result<FsKind, FqError> {
        self.fstype.parse()
    }
}

impl FromStr for Target {
    type Err = FqError;

    fn from_str(s: &str) -> Result<Target, FqError> {
        // split on the last colon, the path is the part that might be odd.
        let (path, fstype) = match s.rfind(':') {
            Some(idx) => (&s[..idx], &s[idx + 1..]),
            None => return Err(FqError::BadTarget(s.to_string())),
        };
        if path.is_empty() || fstype.is_empty() {
            return Err(FqError::BadTarget(s.to_string()));
        }
        Ok(Target {
            path:   PathBuf::from(path),
            fstype: fstype.to_string(),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.fstype)
    }
}

/// Parse a list of `path:kind` strings. One bad entry fails the lot.
pub fn parse_targets<S: AsRef<str>>(specs: &[S]) -> Result<Vec<Target>, FqError> {
    specs.iter().map(|s| s.as_ref().parse()).collect()
}

/// Numbers as a backend reports them, before unit scaling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSample {
    pub blocks_used:  u64,
    pub blocks_soft:  u64,
    pub blocks_hard:  u64,
    pub blocks_grace: Option<u64>,
    pub files_used:   u64,
    pub files_soft:   u64,
    pub files_hard:   u64,
    pub files_grace:  Option<u64>,
    /// Bytes per reported block. 1 when the backend reports bytes.
    pub block_size:   u64,
}

/// Canonical quota record for one user on one path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaRecord {
    pub user:              String,
    pub path:              PathBuf,
    pub filesystem:        FsKind,
    pub blocks_used:       u64,
    pub blocks_soft:       u64,
    pub blocks_hard:       u64,
    pub blocks_grace_days: Option<u64>,
    pub files_used:        u64,
    pub files_soft:        u64,
    pub files_hard:        u64,
    pub files_grace_days:  Option<u64>,
    pub blocks_pct:        Option<f64>,
    pub files_pct:         Option<f64>,
}

impl QuotaRecord {
    /// Over quota means a known percentage above 100.
    pub fn is_over_quota(&self) -> bool {
        matches!(self.blocks_pct, Some(pct) if pct > 100.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FqError {
    #[error("malformed target {0:?}, expected path:filesystem")]
    BadTarget(String),
    #[error("filesystem type {0:?} is not recognized")]
    UnknownKind(String),
    #[error("no such file or directory: {}. Is 'quota' installed?", .0.display())]
    CommandNotFound(PathBuf),
    #[error("running {}: {source}", .cmd.display())]
    CommandFailed {
        cmd:    PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} did not finish within {} seconds", .0.display(), .1)]
    Timeout(PathBuf, u64),
    #[error("cannot parse quota output {0:?}")]
    Parse(String),
    #[error("could not find {}", .0.display())]
    NoDirectory(PathBuf),
    #[error("could not find attribute {0}. Is this a Ceph filesystem?")]
    MissingAttribute(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FqError {
    /// True for errors that invalidate the whole batch rather than one target.
    pub fn is_config(&self) -> bool {
        matches!(self, FqError::BadTarget(_))
    }
}

/// One quota backend.
pub trait QuotaReader {
    fn read(&self, user: &str, path: &Path) -> Result<RawSample, FqError>;
}

fn percent(used: u64, limit: u64) -> Option<f64> {
    if limit == 0 {
        return None;
    }
    let pct = used as f64 / limit as f64 * 100.0;
    Some((pct * 100.0).round() / 100.0)
}

/// Turn a raw sample into a [`QuotaRecord`].
///
/// Block counts are scaled to bytes. The block percentage is computed
/// against the soft limit, or the hard limit for backends without a soft
/// limit, and is `None` when that limit is zero.
pub fn normalize(raw: &RawSample, user: &str, path: &Path, kind: FsKind) -> QuotaRecord {
    let scale = raw.block_size.max(1);
    let blocks_used = raw.blocks_used.saturating_mul(scale);
    let blocks_soft = raw.blocks_soft.saturating_mul(scale);
    let blocks_hard = raw.blocks_hard.saturating_mul(scale);

    let (blocks_limit, files_limit) = if kind.pct_against_hard() {
        (blocks_hard, raw.files_hard)
    } else {
        (blocks_soft, raw.files_soft)
    };

    QuotaRecord {
        user: user.to_string(),
        path: path.to_path_buf(),
        filesystem: kind,
        blocks_used,
        blocks_soft,
        blocks_hard,
        blocks_grace_days: raw.blocks_grace,
        files_used: raw.files_used,
        files_soft: raw.files_soft,
        files_hard: raw.files_hard,
        files_grace_days: raw.files_grace,
        blocks_pct: percent(blocks_used, blocks_limit),
        files_pct: percent(raw.files_used, files_limit),
    }
}

/// Runs the right backend for every user and target.
pub struct Collector {
    readers: HashMap<FsKind, Box<dyn QuotaReader>>,
}

impl Collector {
    /// A collector without any backends.
    pub fn new() -> Collector {
        Collector {
            readers: HashMap::new(),
        }
    }

    /// The `quota` tool for xfs and extended attributes for ceph.
    pub fn standard(opts: QuotaCmdOptions) -> Collector {
        Collector::new()
            .with_reader(FsKind::Xfs, QuotaCmdReader::new(opts))
            .with_reader(FsKind::Ceph, CephReader::new(XattrSource))
    }

    pub fn with_reader<R: QuotaReader + 'static>(mut self, kind: FsKind, reader: R) -> Collector {
        self.readers.insert(kind, Box::new(reader));
        self
    }

    /// Collect one target for one user.
    pub fn collect(&self, user: &str, target: &Target) -> Result<QuotaRecord, FqError> {
        let kind = target.kind()?;
        let reader = match self.readers.get(&kind) {
            Some(r) => r,
            None => return Err(FqError::UnknownKind(target.fstype.clone())),
        };
        let raw = reader.read(user, &target.path)?;
        Ok(normalize(&raw, user, &target.path, kind))
    }

    /// Collect every target for every user.
    ///
    /// A failing target is logged and left out, the rest of the batch
    /// goes on.
    pub fn collect_all<S: AsRef<str>>(&self, users: &[S], targets: &[Target]) -> Vec<QuotaRecord> {
        let mut records = Vec::new();
        for user in users {
            let user = user.as_ref();
            for target in targets {
                match self.collect(user, target) {
                    Ok(rec) => {
                        debug!("collect: {} on {}: {:?}", user, target, rec.blocks_pct);
                        records.push(rec);
                    },
                    Err(e @ FqError::UnknownKind(_)) => error!("{}: {}", target, e),
                    Err(e) => warn!("an error occurred processing quota for {} on {}: {}", user, target, e),
                }
            }
        }
        records
    }

    /// Like [`Collector::collect_all`], but parses the target strings
    /// first. A malformed target fails before anything is read.
    pub fn collect_specs<U, T>(&self, users: &[U], specs: &[T]) -> Result<Vec<QuotaRecord>, FqError>
    where
        U: AsRef<str>,
        T: AsRef<str>,
    {
        let targets = parse_targets(specs)?;
        Ok(self.collect_all(users, &targets))
    }
}

impl Default for Collector {
    fn default() -> Collector {
        Collector::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Fixed(RawSample);

    impl QuotaReader for Fixed {
        fn read(&self, _user: &str, _path: &Path) -> Result<RawSample, FqError> {
            Ok(self.0.clone())
        }
    }

    struct Counting(Rc<Cell<usize>>);

    impl QuotaReader for Counting {
        fn read(&self, user: &str, _path: &Path) -> Result<RawSample, FqError> {
            self.0.set(self.0.get() + 1);
            if user == "broken" {
                return Err(FqError::Parse("garbage".to_string()));
            }
            Ok(RawSample {
                blocks_used: 1,
                blocks_soft: 2,
                block_size: 1,
                ..RawSample::default()
            })
        }
    }

    fn xfs_sample() -> RawSample {
        RawSample {
            blocks_used:  100,
            blocks_soft:  200,
            blocks_hard:  300,
            blocks_grace: Some(0),
            files_used:   5,
            files_soft:   10,
            files_hard:   20,
            files_grace:  Some(0),
            block_size:   1024,
        }
    }

    #[test]
    fn target_parsing() {
        let t: Target = "/home:xfs".parse().unwrap();
        assert_eq!(t.path, PathBuf::from("/home"));
        assert_eq!(t.kind().unwrap(), FsKind::Xfs);
        assert_eq!(t.to_string(), "/home:xfs");

        let t: Target = "/public:nfs".parse().unwrap();
        assert!(matches!(t.kind(), Err(FqError::UnknownKind(_))));

        assert!(matches!("/home".parse::<Target>(), Err(FqError::BadTarget(_))));
        assert!(matches!("/home:".parse::<Target>(), Err(FqError::BadTarget(_))));
        assert!(parse_targets(&["/home:xfs", "/public"]).unwrap_err().is_config());
    }

    #[test]
    fn normalize_xfs_scales_blocks() {
        let rec = normalize(&xfs_sample(), "alice", Path::new("/home"), FsKind::Xfs);
        assert_eq!(rec.blocks_used, 102400);
        assert_eq!(rec.blocks_soft, 204800);
        assert_eq!(rec.blocks_hard, 307200);
        assert_eq!(rec.blocks_pct, Some(50.0));
        assert_eq!(rec.files_pct, Some(50.0));
        assert_eq!(rec.files_used, 5);
        assert!(!rec.is_over_quota());
    }

    #[test]
    fn normalize_rounds_to_two_decimals() {
        let raw = RawSample {
            blocks_used: 1,
            blocks_soft: 3,
            files_used: 2,
            files_soft: 3,
            block_size: 1,
            ..RawSample::default()
        };
        let rec = normalize(&raw, "alice", Path::new("/home"), FsKind::Xfs);
        assert_eq!(rec.blocks_pct, Some(33.33));
        assert_eq!(rec.files_pct, Some(66.67));
    }

    #[test]
    fn zero_soft_limit_means_no_percentage() {
        let raw = RawSample {
            blocks_used: 500,
            blocks_hard: 1000,
            files_used: 3,
            block_size: 1024,
            ..RawSample::default()
        };
        let rec = normalize(&raw, "bob", Path::new("/home"), FsKind::Xfs);
        assert_eq!(rec.blocks_pct, None);
        assert_eq!(rec.files_pct, None);
        assert!(!rec.is_over_quota());
    }

    #[test]
    fn ceph_uses_hard_limit() {
        let raw = RawSample {
            blocks_used: 150,
            blocks_soft: 100,
            blocks_hard: 100,
            files_used: 1,
            files_soft: 4,
            files_hard: 4,
            block_size: 1,
            ..RawSample::default()
        };
        let rec = normalize(&raw, "carol", Path::new("/public"), FsKind::Ceph);
        assert_eq!(rec.blocks_pct, Some(150.0));
        assert_eq!(rec.files_pct, Some(25.0));
        assert_eq!(rec.blocks_grace_days, None);
        assert!(rec.is_over_quota());

        let raw = RawSample {
            blocks_used: 150,
            block_size: 1,
            ..RawSample::default()
        };
        let rec = normalize(&raw, "carol", Path::new("/public"), FsKind::Ceph);
        assert_eq!(rec.blocks_pct, None);
    }

    #[test]
    fn collector_skips_failing_targets() {
        let count = Rc::new(Cell::new(0));
        let collector = Collector::new()
            .with_reader(FsKind::Xfs, Counting(count.clone()))
            .with_reader(FsKind::Ceph, Fixed(xfs_sample()));
        let targets = parse_targets(&["/home:xfs", "/scratch:lustre", "/public:ceph"]).unwrap();

        let recs = collector.collect_all(&["alice", "broken"], &targets);
        // the lustre target never reaches a reader.
        assert_eq!(count.get(), 2);
        let got: Vec<_> = recs.iter().map(|r| (r.user.as_str(), r.filesystem)).collect();
        assert_eq!(
            got,
            vec![("alice", FsKind::Xfs), ("alice", FsKind::Ceph), ("broken", FsKind::Ceph)]
        );
    }

    #[test]
    fn malformed_target_reads_nothing() {
        let count = Rc::new(Cell::new(0));
        let collector = Collector::new().with_reader(FsKind::Xfs, Counting(count.clone()));
        let res = collector.collect_specs(&["alice"], &["/home:xfs", "/public"]);
        assert!(matches!(res, Err(FqError::BadTarget(_))));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn missing_backend_is_unknown_kind() {
        let collector = Collector::new();
        let target: Target = "/home:xfs".parse().unwrap();
        assert!(matches!(collector.collect("alice", &target), Err(FqError::UnknownKind(_))));
    }
}
