//
// Mail users that are over quota, at most once per cooldown window.
//
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use fs_quota::QuotaRecord;

use crate::config;
use crate::mail::{Email, Mailer};
use crate::report::{self, Format};
use crate::throttle::{CooldownStore, Throttle};
use crate::unixuser::Homes;

const DEFAULT_SUBJECT: &str = "Your account is over quota";
const DEFAULT_SIGNATURE: &str = "The storage administrators";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub hostname:        String,
    pub homes:           Homes,
    /// Used for `user@domain` when there is no `.forward`.
    pub domain:          Option<String>,
    pub subject:         Option<String>,
    pub support_address: Option<String>,
    pub signature:       Option<String>,
    /// Leave the marker alone when delivery fails.
    pub keep_marker_on_failure: bool,
}

impl Settings {
    pub fn from_config(cfg: &config::Config, hostname: String) -> Settings {
        Settings {
            hostname,
            homes: cfg.homes(),
            domain: cfg.notify.domain.clone(),
            subject: cfg.notify.subject.clone(),
            support_address: cfg.notify.support_address.clone(),
            signature: cfg.notify.signature.clone(),
            keep_marker_on_failure: cfg.notify.keep_marker_on_failure,
        }
    }
}

/// What happened during one notification pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub sent:        Vec<String>,
    pub cooling:     Vec<String>,
    pub unreachable: Vec<String>,
    pub failed:      Vec<String>,
}

pub struct Notifier<'a, S, M> {
    throttle: &'a Throttle<S>,
    mailer:   &'a M,
    settings: Settings,
}

// first address in a .forward file.
fn forward_address(path: &Path) -> io::Result<Option<String>> {
    let text = fs::read_to_string(path)?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        for word in line.split(',') {
            let addr = word.trim().trim_start_matches('\\').trim_matches('"');
            if addr.contains('@') && !addr.starts_with('|') {
                return Ok(Some(addr.to_string()));
            }
        }
    }
    Ok(None)
}

impl<'a, S: CooldownStore, M: Mailer> Notifier<'a, S, M> {
    pub fn new(throttle: &'a Throttle<S>, mailer: &'a M, settings: Settings) -> Notifier<'a, S, M> {
        Notifier {
            throttle,
            mailer,
            settings,
        }
    }

    /// Where to send mail for `user`: the `.forward` file, else `user@domain`.
    pub fn recipient(&self, user: &str) -> Option<String> {
        let forward = match self.settings.homes.home(user) {
            Ok(home) => home.join(".forward"),
            Err(e) => {
                warn!("cannot find home directory of {}: {}", user, e);
                return self.settings.domain.as_ref().map(|d| format!("{}@{}", user, d));
            },
        };
        match forward_address(&forward) {
            Ok(Some(addr)) => return Some(addr),
            Ok(None) => debug!("{}: no address in file", forward.display()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{}: does not exist", forward.display())
            },
            Err(e) => warn!("{}: {}", forward.display(), e),
        }
        self.settings.domain.as_ref().map(|d| format!("{}@{}", user, d))
    }

    pub fn body(&self, records: &[QuotaRecord]) -> String {
        let table = report::short_report(records, Format::Html);
        let mut body = String::from("<p> Your user account on ");
        body += &self.settings.hostname;
        body += " has gone over your data quota on one or more file systems: <br>";
        body += &table;
        body += "<br>Please remove any unneeded files as soon as possible";
        match self.settings.support_address {
            Some(ref addr) => {
                body += " and reply to this email (or contact us at ";
                body += addr;
                body += ") if you need any additional help or have questions/comments.";
            },
            None => body += " and reply to this email if you need any additional help.",
        }
        body += "<br><br>Thanks, <br>";
        body += self.settings.signature.as_deref().unwrap_or(DEFAULT_SIGNATURE);
        body
    }

    /// Send one mail per over-quota user listing every path they are over on.
    pub fn notify_users(&self, records: &[QuotaRecord]) -> Summary {
        // we never want to mail someone who isn't over quota.
        let mut by_user: BTreeMap<String, Vec<QuotaRecord>> = BTreeMap::new();
        for rec in report::filter_over_quota(records) {
            by_user.entry(rec.user.clone()).or_default().push(rec);
        }

        let mut summary = Summary::default();
        for (user, recs) in &by_user {
            let user = user.as_str();
            // check the address first, an unreachable user should not burn a window.
            let to = match self.recipient(user) {
                Some(to) => to,
                None => {
                    error!("No .forward file and no mail domain! User {} cannot be notified!", user);
                    summary.unreachable.push(user.to_string());
                    continue;
                },
            };

            let claim = match self.throttle.claim(user) {
                Ok(Some(c)) => c,
                Ok(None) => {
                    summary.cooling.push(user.to_string());
                    continue;
                },
                Err(e) => {
                    error!("cannot check notification marker for {}: {}", user, e);
                    summary.failed.push(user.to_string());
                    continue;
                },
            };

            let email = Email {
                to,
                subject: self.settings.subject.clone().unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
                html: self.body(recs),
            };
            match self.mailer.send(&email) {
                Ok(()) => {
                    info!("notified {} at {}", user, email.to);
                    summary.sent.push(user.to_string());
                },
                Err(e) => {
                    error!("mail to {} for {} failed: {}", email.to, user, e);
                    if self.settings.keep_marker_on_failure {
                        drop(claim);
                    } else {
                        let who = claim.user().to_string();
                        if let Err(e) = self.throttle.release(claim) {
                            error!("cannot reset notification marker for {}: {}", who, e);
                        }
                    }
                    summary.failed.push(user.to_string());
                },
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MailError;
    use crate::throttle::MemoryStore;
    use fs_quota::FsKind;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};

    const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

    #[derive(Default)]
    struct FakeMailer {
        sent: RefCell<Vec<Email>>,
        fail: bool,
    }

    impl Mailer for FakeMailer {
        fn send(&self, email: &Email) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::Rejected(500));
            }
            self.sent.borrow_mut().push(email.clone());
            Ok(())
        }
    }

    fn record(user: &str, path: &str, pct: Option<f64>) -> QuotaRecord {
        QuotaRecord {
            user:              user.to_string(),
            path:              PathBuf::from(path),
            filesystem:        FsKind::Ceph,
            blocks_used:       2048,
            blocks_soft:       1024,
            blocks_hard:       1024,
            blocks_grace_days: None,
            files_used:        1,
            files_soft:        0,
            files_hard:        0,
            files_grace_days:  None,
            blocks_pct:        pct,
            files_pct:         None,
        }
    }

    fn homes(users: &[(&str, Option<&str>)]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for (user, forward) in users {
            let home = root.path().join(user);
            fs::create_dir(&home).unwrap();
            if let Some(addr) = forward {
                fs::write(home.join(".forward"), format!("# mail\n\\{}\n", addr)).unwrap();
            }
        }
        root
    }

    fn settings(root: &Path) -> Settings {
        Settings {
            hostname: "login01".to_string(),
            homes: Homes::Under(root.to_path_buf()),
            support_address: Some("help@example.org".to_string()),
            ..Settings::default()
        }
    }

    #[test]
    fn mails_each_over_quota_user_once() {
        let root = homes(&[("alice", Some("alice@example.org")), ("bob", Some("bob@example.org"))]);
        let throttle = Throttle::new(MemoryStore::new(), WEEK);
        let mailer = FakeMailer::default();
        let notifier = Notifier::new(&throttle, &mailer, settings(root.path()));

        let records = vec![
            record("alice", "/home", Some(150.0)),
            record("alice", "/public", Some(101.5)),
            record("bob", "/home", Some(99.0)),
            record("bob", "/public", None),
        ];
        let summary = notifier.notify_users(&records);
        assert_eq!(summary.sent, vec!["alice"]);

        let sent = mailer.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "alice@example.org");
        assert!(sent[0].html.contains("login01"));
        assert!(sent[0].html.contains("/public"));
        assert!(sent[0].html.contains("help@example.org"));
        drop(sent);

        // second pass in the same window sends nothing.
        let summary = notifier.notify_users(&records);
        assert_eq!(summary.cooling, vec!["alice"]);
        assert_eq!(mailer.sent.borrow().len(), 1);
    }

    #[test]
    fn unreachable_user_keeps_no_marker() {
        let root = homes(&[("carol", None)]);
        let throttle = Throttle::new(MemoryStore::new(), WEEK);
        let mailer = FakeMailer::default();
        let notifier = Notifier::new(&throttle, &mailer, settings(root.path()));

        let summary = notifier.notify_users(&[record("carol", "/home", Some(200.0))]);
        assert_eq!(summary.unreachable, vec!["carol"]);
        assert!(mailer.sent.borrow().is_empty());
        assert_eq!(throttle.store().last_notified("carol").unwrap(), None);
    }

    #[test]
    fn domain_fallback() {
        let root = homes(&[("dave", None)]);
        let throttle = Throttle::new(MemoryStore::new(), WEEK);
        let mailer = FakeMailer::default();
        let mut s = settings(root.path());
        s.domain = Some("example.org".to_string());
        let notifier = Notifier::new(&throttle, &mailer, s);
        assert_eq!(notifier.recipient("dave").as_deref(), Some("dave@example.org"));
    }

    #[test]
    fn failed_delivery_resets_marker() {
        let root = homes(&[("erin", Some("erin@example.org"))]);
        let throttle = Throttle::new(MemoryStore::new(), WEEK);
        let old = SystemTime::now() - 2 * WEEK;
        throttle.store().record("erin", old).unwrap();
        let mailer = FakeMailer {
            fail: true,
            ..FakeMailer::default()
        };
        let notifier = Notifier::new(&throttle, &mailer, settings(root.path()));

        let summary = notifier.notify_users(&[record("erin", "/home", Some(120.0))]);
        assert_eq!(summary.failed, vec!["erin"]);
        assert_eq!(throttle.store().last_notified("erin").unwrap(), Some(old));
    }

    #[test]
    fn failed_delivery_can_keep_marker() {
        let root = homes(&[("fred", Some("fred@example.org"))]);
        let throttle = Throttle::new(MemoryStore::new(), WEEK);
        let mailer = FakeMailer {
            fail: true,
            ..FakeMailer::default()
        };
        let mut s = settings(root.path());
        s.keep_marker_on_failure = true;
        let notifier = Notifier::new(&throttle, &mailer, s);

        notifier.notify_users(&[record("fred", "/home", Some(120.0))]);
        assert!(throttle.store().last_notified("fred").unwrap().is_some());
    }

    #[test]
    fn forward_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join(".forward");
        fs::write(&f, "\"|/usr/bin/procmail\"\n\\me, me@example.org\n").unwrap();
        assert_eq!(forward_address(&f).unwrap().as_deref(), Some("me@example.org"));
        fs::write(&f, "localonly\n").unwrap();
        assert_eq!(forward_address(&f).unwrap(), None);
    }
}
