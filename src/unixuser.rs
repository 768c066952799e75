use std::ffi::{CStr, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use libc::{c_char, getpwnam_r, getpwuid_r};

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub uid:  u32,
    pub gid:  u32,
    pub dir:  PathBuf,
}

unsafe fn cptr_to_path<'a>(c: *const c_char) -> &'a Path {
    let bytes = CStr::from_ptr(c).to_bytes();
    Path::new(OsStr::from_bytes(bytes))
}

unsafe fn to_user(pwd: &libc::passwd) -> User {
    // turn into (unsafe!) rust slices
    let cs_name = CStr::from_ptr(pwd.pw_name);
    let cs_dir = cptr_to_path(pwd.pw_dir);

    // then turn the slices into safe owned values.
    User {
        name: cs_name.to_string_lossy().into_owned(),
        dir:  cs_dir.to_path_buf(),
        uid:  pwd.pw_uid,
        gid:  pwd.pw_gid,
    }
}

impl User {
    pub fn by_name(name: &str) -> Result<User, io::Error> {
        let mut buf = [0; 4096];
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        let cname = match std::ffi::CString::new(name) {
            Ok(un) => un,
            Err(_) => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
        };
        let ret = unsafe {
            getpwnam_r(
                cname.as_ptr(),
                &mut pwd as *mut _,
                buf.as_mut_ptr(),
                buf.len() as libc::size_t,
                &mut result as *mut _,
            )
        };
        if ret == 0 {
            if result.is_null() {
                return Err(io::Error::new(io::ErrorKind::NotFound, format!("no such user: {}", name)));
            }
            let p = unsafe { to_user(&pwd) };
            Ok(p)
        } else {
            Err(io::Error::from_raw_os_error(ret))
        }
    }

    pub fn by_uid(uid: u32) -> Result<User, io::Error> {
        let mut buf = [0; 4096];
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        let ret = unsafe {
            getpwuid_r(
                uid,
                &mut pwd as *mut _,
                buf.as_mut_ptr(),
                buf.len() as libc::size_t,
                &mut result as *mut _,
            )
        };
        if ret == 0 {
            if result.is_null() {
                return Err(io::Error::new(io::ErrorKind::NotFound, format!("no such uid: {}", uid)));
            }
            let p = unsafe { to_user(&pwd) };
            Ok(p)
        } else {
            Err(io::Error::from_raw_os_error(ret))
        }
    }
}

/// The effective uid of this process.
pub fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Names of all accounts in the password database with a uid above `min_uid`.
///
/// getpwent() keeps its cursor in static storage; we only call this
/// from the main thread.
pub fn all_users(min_uid: u32) -> Vec<String> {
    let mut users = Vec::new();
    unsafe {
        libc::setpwent();
        loop {
            let pwd = libc::getpwent();
            if pwd.is_null() {
                break;
            }
            let u = to_user(&*pwd);
            if u.uid > min_uid {
                users.push(u.name);
            }
        }
        libc::endpwent();
    }
    users.sort();
    users.dedup();
    users
}

/// How to find a user's home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Homes {
    /// The home directory from the password database.
    Passwd,
    /// `<dir>/<user>`.
    Under(PathBuf),
}

impl Default for Homes {
    fn default() -> Homes {
        Homes::Passwd
    }
}

impl Homes {
    pub fn home(&self, user: &str) -> io::Result<PathBuf> {
        match self {
            Homes::Passwd => User::by_name(user).map(|u| u.dir),
            Homes::Under(dir) => Ok(dir.join(user)),
        }
    }
}
