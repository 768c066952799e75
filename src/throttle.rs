//! Per-user notification cooldown.
//!
//! A user who was mailed less than one cooldown window ago is not mailed
//! again. The time of the last notification lives in a [`CooldownStore`],
//! by default one marker file per user whose mtime is the timestamp, so
//! the state survives restarts.
#[cfg(test)]
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
#[cfg(test)]
use std::sync::MutexGuard;
use std::time::{Duration, SystemTime};

use filetime::FileTime;

use crate::unixuser::{self, Homes, User};

pub const MARKER_NAME: &str = ".quota";

/// user -> time of the last notification.
pub trait CooldownStore {
    fn last_notified(&self, user: &str) -> io::Result<Option<SystemTime>>;
    /// Create or update the marker.
    fn record(&self, user: &str, at: SystemTime) -> io::Result<()>;
    /// Remove the marker, if any.
    fn forget(&self, user: &str) -> io::Result<()>;
}

/// Marker files, `~user/.quota` or `<dir>/<user>`.
#[derive(Debug, Clone)]
pub struct MarkerFiles {
    location: MarkerLocation,
}

#[derive(Debug, Clone)]
enum MarkerLocation {
    Home(Homes),
    Dir(PathBuf),
}

impl MarkerFiles {
    /// `.quota` in the user's home directory. The file is handed to the
    /// user when we are root.
    pub fn in_homes(homes: Homes) -> MarkerFiles {
        MarkerFiles {
            location: MarkerLocation::Home(homes),
        }
    }

    /// One file per user in a spool directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> MarkerFiles {
        MarkerFiles {
            location: MarkerLocation::Dir(dir.into()),
        }
    }

    fn path(&self, user: &str) -> io::Result<PathBuf> {
        if user.is_empty() || user.contains('/') || user.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad user name {:?}", user),
            ));
        }
        match self.location {
            MarkerLocation::Home(ref homes) => Ok(homes.home(user)?.join(MARKER_NAME)),
            MarkerLocation::Dir(ref dir) => Ok(dir.join(user)),
        }
    }
}

// open the marker, never through a symlink. The bool is true if we created it.
fn open_marker(path: &Path) -> io::Result<(File, bool)> {
    let flags = libc::O_NOFOLLOW | libc::O_NONBLOCK;
    let file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .custom_flags(flags)
        .open(path)
    {
        Ok(f) => {
            debug!("{}: marker doesn't exist, created", path.display());
            return Ok((f, true));
        },
        Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => {
            OpenOptions::new().write(true).custom_flags(flags).open(path)?
        },
        Err(e) => return Err(e),
    };
    if !file.metadata()?.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: not a regular file", path.display()),
        ));
    }
    Ok((file, false))
}

impl CooldownStore for MarkerFiles {
    fn last_notified(&self, user: &str) -> io::Result<Option<SystemTime>> {
        match fs::symlink_metadata(self.path(user)?) {
            Ok(m) if m.is_file() => Ok(Some(m.modified()?)),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("marker for {} is not a regular file", user),
            )),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn record(&self, user: &str, at: SystemTime) -> io::Result<()> {
        let path = self.path(user)?;
        let (file, created) = open_marker(&path)?;
        filetime::set_file_handle_times(&file, None, Some(FileTime::from_system_time(at)))?;

        if created && unixuser::effective_uid() == 0 {
            if let MarkerLocation::Home(_) = self.location {
                match User::by_name(user) {
                    Ok(u) => {
                        if let Err(e) = std::os::unix::fs::fchown(&file, Some(u.uid), Some(u.gid)) {
                            warn!("{}: chown to {}: {}", path.display(), user, e);
                        }
                    },
                    Err(e) => warn!("{}: cannot look up {}: {}", path.display(), user, e),
                }
            }
        }
        Ok(())
    }

    fn forget(&self, user: &str) -> io::Result<()> {
        // removes a symlink itself, never its target.
        match fs::remove_file(self.path(user)?) {
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Keeps markers in memory only.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, SystemTime>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn map(&self) -> MutexGuard<HashMap<String, SystemTime>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
impl CooldownStore for MemoryStore {
    fn last_notified(&self, user: &str) -> io::Result<Option<SystemTime>> {
        Ok(self.map().get(user).cloned())
    }

    fn record(&self, user: &str, at: SystemTime) -> io::Result<()> {
        self.map().insert(user.to_string(), at);
        Ok(())
    }

    fn forget(&self, user: &str) -> io::Result<()> {
        self.map().remove(user);
        Ok(())
    }
}

/// What to do for a user who has never been notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstContact {
    /// Notify right away and start the window.
    Immediate,
    /// Only start the window; the first mail goes out once it has passed.
    AfterWindow,
}

impl Default for FirstContact {
    fn default() -> FirstContact {
        FirstContact::Immediate
    }
}

impl FromStr for FirstContact {
    type Err = String;

    fn from_str(s: &str) -> Result<FirstContact, String> {
        match s {
            "immediate" => Ok(FirstContact::Immediate),
            "after-window" => Ok(FirstContact::AfterWindow),
            other => Err(format!("unknown first-contact policy {:?}", other)),
        }
    }
}

/// A granted notification. Handing it back to [`Throttle::release`]
/// restores the marker as it was before.
#[derive(Debug)]
#[must_use]
pub struct Claim {
    user:     String,
    previous: Option<SystemTime>,
}

impl Claim {
    pub fn user(&self) -> &str {
        &self.user
    }
}

pub struct Throttle<S> {
    store:         S,
    window:        Duration,
    first_contact: FirstContact,
    // serializes read-modify-write of the markers.
    lock:          Mutex<()>,
}

impl<S: CooldownStore> Throttle<S> {
    pub fn new(store: S, window: Duration) -> Throttle<S> {
        Throttle {
            store,
            window,
            first_contact: FirstContact::default(),
            lock: Mutex::new(()),
        }
    }

    pub fn first_contact(mut self, policy: FirstContact) -> Self {
        self.first_contact = policy;
        self
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Should `user` be notified now? If so the marker is moved to now.
    #[cfg(test)]
    pub fn should_notify(&self, user: &str) -> io::Result<bool> {
        Ok(self.claim(user)?.is_some())
    }

    pub fn claim(&self, user: &str) -> io::Result<Option<Claim>> {
        self.claim_at(user, SystemTime::now())
    }

    pub fn claim_at(&self, user: &str, now: SystemTime) -> io::Result<Option<Claim>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let last = match self.store.last_notified(user)? {
            Some(t) => t,
            None => {
                self.store.record(user, now)?;
                return Ok(match self.first_contact {
                    FirstContact::Immediate => {
                        info!("User {} notified for the first time - created marker", user);
                        Some(Claim {
                            user:     user.to_string(),
                            previous: None,
                        })
                    },
                    FirstContact::AfterWindow => {
                        debug!("User {}: marker created, first notice after the window", user);
                        None
                    },
                });
            },
        };

        // a marker in the future counts as just touched.
        let elapsed = now.duration_since(last).unwrap_or(Duration::from_secs(0));
        if elapsed < self.window {
            debug!("User {}: last notified {} seconds ago, skipping", user, elapsed.as_secs());
            return Ok(None);
        }
        debug!("User {}: marker was last touched {} seconds ago", user, elapsed.as_secs());
        info!("User {} notified - updating quota marker", user);
        self.store.record(user, now)?;
        Ok(Some(Claim {
            user:     user.to_string(),
            previous: Some(last),
        }))
    }

    /// Undo a claim, e.g. because the mail could not be delivered.
    pub fn release(&self, claim: Claim) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match claim.previous {
            Some(t) => self.store.record(&claim.user, t),
            None => self.store.forget(&claim.user),
        }
    }
}
