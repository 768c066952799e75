//
// Ceph quota, read from the extended attributes of <path>/<user>.
//
use std::io;
use std::path::Path;

use crate::{FqError, QuotaReader, RawSample};

const MAX_BYTES: &str = "ceph.quota.max_bytes";
const RBYTES: &str = "ceph.dir.rbytes";
const MAX_FILES: &str = "ceph.quota.max_files";
const RFILES: &str = "ceph.dir.rfiles";

/// The attributes a Ceph quota directory must carry.
pub const CEPH_ATTRS: [&str; 4] = [MAX_BYTES, RBYTES, MAX_FILES, RFILES];

/// Where extended attributes come from.
pub trait AttrSource {
    /// Ok(None) if the attribute is not set.
    fn get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Real extended attributes, through the `xattr` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct XattrSource;

#[cfg(unix)]
impl AttrSource for XattrSource {
    fn get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        xattr::get(path, name)
    }
}

#[cfg(not(unix))]
impl AttrSource for XattrSource {
    fn get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        crate::generic_os::get_xattr(path, name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CephReader<A = XattrSource> {
    attrs: A,
}

impl<A: AttrSource> CephReader<A> {
    pub fn new(attrs: A) -> CephReader<A> {
        CephReader { attrs }
    }

    fn attr(&self, dir: &Path, key: &'static str) -> Result<u64, FqError> {
        let value = match self.attrs.get(dir, key)? {
            Some(v) => v,
            None => return Err(FqError::MissingAttribute(key)),
        };
        // ceph reports these as decimal text.
        let text = String::from_utf8_lossy(&value);
        let text = text.trim_end_matches('\0').trim();
        text.parse::<u64>()
            .map_err(|_| FqError::Parse(format!("{}={}", key, text)))
    }
}

impl<A: AttrSource> QuotaReader for CephReader<A> {
    fn read(&self, user: &str, path: &Path) -> Result<RawSample, FqError> {
        let dir = path.join(user);
        match std::fs::metadata(&dir) {
            Ok(ref m) if m.is_dir() => {},
            _ => return Err(FqError::NoDirectory(dir)),
        }

        let max_bytes = self.attr(&dir, MAX_BYTES)?;
        let rbytes = self.attr(&dir, RBYTES)?;
        let max_files = self.attr(&dir, MAX_FILES)?;
        let rfiles = self.attr(&dir, RFILES)?;

        // one limit per resource, it serves as both soft and hard.
        Ok(RawSample {
            blocks_used:  rbytes,
            blocks_soft:  max_bytes,
            blocks_hard:  max_bytes,
            blocks_grace: None,
            files_used:   rfiles,
            files_soft:   max_files,
            files_hard:   max_files,
            files_grace:  None,
            block_size:   1,
        })
    }
}
