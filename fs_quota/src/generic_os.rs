//
// No extended attributes on this platform.
//
use std::io;
use std::path::Path;

pub(crate) fn get_xattr(_path: &Path, _name: &str) -> io::Result<Option<Vec<u8>>> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "extended attributes are not supported"))
}
