//
//  connect-quota: report per-user storage quota on xfs and ceph
//  filesystems, and mail the users who are over it.
//
//  connect-quota --path /home:xfs /public:ceph --all-users --only-full
//
#[macro_use]
extern crate log;

mod config;
mod mail;
mod notify;
mod report;
mod throttle;
mod unixuser;

use std::path::PathBuf;
use std::process::exit;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context as _};
use clap::Parser;
use log::LevelFilter;

use fs_quota::{parse_targets, Collector, QuotaRecord};

use crate::config::{Config, MailConfig};
use crate::mail::{Email, MailgunMailer, Mailer};
use crate::notify::Notifier;
use crate::report::{Format, ReportKind};
use crate::throttle::{MarkerFiles, Throttle};

#[derive(Parser, Debug)]
#[command(name = "connect-quota", version, about = "Report per-user storage quota")]
struct Cli {
    /// user(s) for whom to get quota information (root only)
    #[arg(long, num_args = 1..)]
    user: Option<Vec<String>>,

    /// Retrieve all users from the password database above the minimum uid
    #[arg(long, conflicts_with = "user")]
    all_users: bool,

    /// path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// log level, e.g. error, warn, info, debug
    #[arg(long)]
    log: Option<String>,

    /// Which columns to report (short, full)
    #[arg(long, default_value = "short")]
    report: ReportKind,

    /// Table format (simple, plain, github, psql, grid, rounded, html, json)
    #[arg(long, default_value = "simple")]
    fmt: Format,

    /// Only report users who have gone beyond their quota
    #[arg(long)]
    only_full: bool,

    /// paths with a colon delimited filesystem type, e.g. /home:xfs /public:ceph
    #[arg(long, num_args = 1..)]
    path: Option<Vec<String>>,

    /// Email the report to this address
    #[arg(long)]
    mailto: Option<String>,

    /// Write an email to every user over quota
    #[arg(long, conflicts_with = "mailto")]
    notify_users: bool,
}

struct Context {
    euid:   u32,
    config: Config,
}

fn init_logging(level: Option<&str>) -> anyhow::Result<()> {
    match level {
        Some(l) => {
            let level = LevelFilter::from_str(l).map_err(|_| anyhow!("invalid log level: {}", l))?;
            env_logger::Builder::new().filter_level(level).init();
        },
        None => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("error")).init();
        },
    }
    Ok(())
}

fn gethostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".into())
}

// Who to report on. Only root may ask for someone else.
fn select_users(cli: &Cli, ctx: &Context) -> anyhow::Result<Vec<String>> {
    if ctx.euid != 0 && cli.user.is_some() {
        bail!("Only root can get quotas for another user");
    }
    if cli.all_users {
        debug!("Getting information for all users");
        return Ok(unixuser::all_users(ctx.config.min_uid()));
    }
    match cli.user {
        Some(ref users) => {
            debug!("Getting information for particular user");
            Ok(users.clone())
        },
        None => {
            debug!("Getting information for current user");
            let me = unixuser::User::by_uid(ctx.euid).context("looking up current user")?;
            Ok(vec![me.name])
        },
    }
}

fn collect(cli: &Cli, ctx: &Context, collector: &Collector) -> anyhow::Result<Vec<QuotaRecord>> {
    let specs = match cli.path {
        Some(ref p) if !p.is_empty() => p,
        _ => bail!("You must specify a path, e.g. /home:xfs"),
    };
    let users = select_users(cli, ctx)?;
    let targets = parse_targets(specs)?;
    Ok(collector.collect_all(&users, &targets))
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = match cli.config {
        Some(ref file) => config::read(file).with_context(|| format!("{}", file.display()))?,
        None => Config::default(),
    };
    let ctx = Context {
        euid: unixuser::effective_uid(),
        config,
    };
    let collector = Collector::standard(ctx.config.quota_cmd());

    let mut quota = collect(cli, &ctx, &collector)?;

    if cli.only_full {
        quota = report::filter_over_quota(&quota);
        if quota.is_empty() {
            println!("All users OK - nothing to report");
            return Ok(());
        }
    }

    if let Some(ref to) = cli.mailto {
        let mailer = MailgunMailer::new(MailConfig::from_env(&ctx.config.mail)?)?;
        let subject = match ctx.config.mail.subject {
            Some(ref s) => s.clone(),
            None => format!("Quota report for {}", gethostname()),
        };
        let email = Email {
            to:      to.clone(),
            subject,
            html:    report::report(&quota, cli.report, Format::Html),
        };
        mailer.send(&email)?;
    } else if cli.notify_users {
        let mailer = MailgunMailer::new(MailConfig::from_env(&ctx.config.mail)?)?;
        let store = match ctx.config.notify.marker_dir {
            Some(ref dir) => MarkerFiles::in_dir(dir),
            None => MarkerFiles::in_homes(ctx.config.homes()),
        };
        let throttle = Throttle::new(store, ctx.config.cooldown())
            .first_contact(ctx.config.notify.first_contact.unwrap_or_default());
        let settings = notify::Settings::from_config(&ctx.config, gethostname());
        let summary = Notifier::new(&throttle, &mailer, settings).notify_users(&quota);
        info!(
            "notified {}, cooling down {}, unreachable {}, failed {}",
            summary.sent.len(),
            summary.cooling.len(),
            summary.unreachable.len(),
            summary.failed.len()
        );
    } else {
        println!("{}", report::report(&quota, cli.report, cli.fmt));
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log.as_deref()) {
        eprintln!("connect-quota: {}", e);
        exit(1);
    }

    if let Err(e) = run(&cli) {
        eprintln!("connect-quota: {:#}", e);
        exit(1);
    }
}
