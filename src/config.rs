use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Deserializer};
use url::Url;

use fs_quota::QuotaCmdOptions;

use crate::throttle::FirstContact;
use crate::unixuser::Homes;

pub const DEFAULT_MAIL_URL: &str = "https://api.mailgun.net/v3/api.ci-connect.net/messages";
pub const DEFAULT_FROM: &str = "<noreply@api.ci-connect.net>";
pub const DEFAULT_COOLDOWN_DAYS: u64 = 7;
pub const MAX_COOLDOWN_DAYS: u64 = 36500;
pub const DEFAULT_MIN_UID: u32 = 1000;

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub mail:   Mail,
    #[serde(default)]
    pub notify: Notify,
    #[serde(default)]
    pub quota:  Quota,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Mail {
    #[serde(default)]
    pub url:     Option<String>,
    #[serde(rename = "api-key", default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub from:    Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Notify {
    #[serde(rename = "cooldown-days", default)]
    pub cooldown_days:   Option<u64>,
    #[serde(rename = "first-contact", deserialize_with = "deserialize_opt_enum", default)]
    pub first_contact:   Option<FirstContact>,
    #[serde(rename = "keep-marker-on-failure", default)]
    pub keep_marker_on_failure: bool,
    #[serde(rename = "marker-dir", default)]
    pub marker_dir:      Option<PathBuf>,
    #[serde(rename = "home-root", default)]
    pub home_root:       Option<PathBuf>,
    #[serde(default)]
    pub domain:          Option<String>,
    #[serde(default)]
    pub subject:         Option<String>,
    #[serde(rename = "support-address", default)]
    pub support_address: Option<String>,
    #[serde(default)]
    pub signature:       Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Quota {
    #[serde(default)]
    pub command:      Option<PathBuf>,
    #[serde(rename = "block-size", default)]
    pub block_size:   Option<u64>,
    #[serde(rename = "timeout-secs", default)]
    pub timeout_secs: Option<u64>,
    #[serde(rename = "min-uid", default)]
    pub min_uid:      Option<u32>,
}

pub fn deserialize_opt_enum<'de, D, E>(deserializer: D) -> Result<Option<E>, D::Error>
where
    D: Deserializer<'de>,
    E: std::str::FromStr,
    E::Err: std::fmt::Display,
{
    String::deserialize(deserializer)?
        .as_str()
        .parse::<E>()
        .map(|e| Some(e))
        .map_err(serde::de::Error::custom)
}

// Read the TOML config into a config::Config struct.
pub fn read(toml_file: impl AsRef<Path>) -> io::Result<Config> {
    let buffer = fs::read_to_string(&toml_file)?;
    parse(&buffer)
}

pub fn parse(buffer: &str) -> io::Result<Config> {
    let config: Config = match toml::from_str(buffer) {
        Ok(v) => Ok(v),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }?;
    check(&config)?;
    Ok(config)
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub fn check(config: &Config) -> io::Result<()> {
    if config.quota.block_size == Some(0) {
        return Err(invalid("[quota]: block-size must be positive".to_string()));
    }
    if config.quota.timeout_secs == Some(0) {
        return Err(invalid("[quota]: timeout-secs must be positive".to_string()));
    }
    if let Some(days) = config.notify.cooldown_days {
        if days > MAX_COOLDOWN_DAYS {
            return Err(invalid(format!("[notify]: cooldown-days must be at most {}", MAX_COOLDOWN_DAYS)));
        }
    }
    if let Some(ref url) = config.mail.url {
        if let Err(e) = Url::parse(url) {
            return Err(invalid(format!("[mail]: url {}: {}", url, e)));
        }
    }
    Ok(())
}

impl Config {
    pub fn quota_cmd(&self) -> QuotaCmdOptions {
        let mut opts = QuotaCmdOptions::default();
        if let Some(ref cmd) = self.quota.command {
            opts.command = cmd.clone();
        }
        if let Some(bs) = self.quota.block_size {
            opts.block_size = bs;
        }
        if let Some(secs) = self.quota.timeout_secs {
            opts.timeout = Duration::from_secs(secs);
        }
        opts
    }

    pub fn min_uid(&self) -> u32 {
        self.quota.min_uid.unwrap_or(DEFAULT_MIN_UID)
    }

    pub fn cooldown(&self) -> Duration {
        let days = self.notify.cooldown_days.unwrap_or(DEFAULT_COOLDOWN_DAYS);
        match days.checked_mul(24 * 3600) {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::MAX,
        }
    }

    pub fn homes(&self) -> Homes {
        match self.notify.home_root {
            Some(ref dir) => Homes::Under(dir.clone()),
            None => Homes::Passwd,
        }
    }
}

/// Everything the mail transport needs, resolved once.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub url:     Url,
    pub api_key: Option<String>,
    pub from:    String,
}

impl MailConfig {
    /// Combine the `[mail]` section with `MAILGUN_URL` and `MAILGUN_API_KEY`.
    /// The environment wins.
    pub fn resolve<F>(mail: &Mail, getenv: F) -> io::Result<MailConfig>
    where F: Fn(&str) -> Option<String> {
        let url = match getenv("MAILGUN_URL").or_else(|| mail.url.clone()) {
            Some(u) => u,
            None => {
                warn!("No MAILGUN_URL found in environment, using default");
                DEFAULT_MAIL_URL.to_string()
            },
        };
        let url = Url::parse(&url).map_err(|e| invalid(format!("mail url {}: {}", url, e)))?;
        let api_key = getenv("MAILGUN_API_KEY")
            .or_else(|| mail.api_key.clone())
            .filter(|k| !k.is_empty());
        Ok(MailConfig {
            url,
            api_key,
            from: mail.from.clone().unwrap_or_else(|| DEFAULT_FROM.to_string()),
        })
    }

    pub fn from_env(mail: &Mail) -> io::Result<MailConfig> {
        MailConfig::resolve(mail, |k| std::env::var(k).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.min_uid(), 1000);
        assert_eq!(config.cooldown(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.homes(), Homes::Passwd);
        let opts = config.quota_cmd();
        assert_eq!(opts.command, PathBuf::from("/bin/quota"));
        assert_eq!(opts.block_size, 1024);
    }

    #[test]
    fn full_config() {
        let config = parse(
            r#"
            [mail]
            url = "https://mail.example.org/v3/messages"
            from = "Quota <quota@example.org>"

            [notify]
            cooldown-days = 3
            first-contact = "after-window"
            home-root = "/home"
            domain = "example.org"

            [quota]
            command = "/usr/bin/quota"
            timeout-secs = 5
            min-uid = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.cooldown(), Duration::from_secs(3 * 24 * 3600));
        assert_eq!(config.notify.first_contact, Some(FirstContact::AfterWindow));
        assert_eq!(config.homes(), Homes::Under(PathBuf::from("/home")));
        assert_eq!(config.min_uid(), 500);
        assert_eq!(config.quota_cmd().timeout, Duration::from_secs(5));
        assert_eq!(config.notify.domain.as_deref(), Some("example.org"));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(parse("[quota]\nblock-size = 0\n").is_err());
        assert!(parse("[mail]\nurl = \"not a url\"\n").is_err());
        assert!(parse("[notify]\nfirst-contact = \"sometimes\"\n").is_err());
        assert!(parse("[quota\n").is_err());
    }

    #[test]
    fn huge_cooldown() {
        assert!(parse("[notify]\ncooldown-days = 36500\n").is_ok());
        assert!(parse("[notify]\ncooldown-days = 36501\n").is_err());

        // a config built in code skips check(), cooldown() must still not overflow.
        let mut config = Config::default();
        config.notify.cooldown_days = Some(u64::MAX);
        assert_eq!(config.cooldown(), Duration::MAX);
    }

    #[test]
    fn environment_overrides_file() {
        let mail = Mail {
            url: Some("https://file.example.org/messages".to_string()),
            api_key: Some("from-file".to_string()),
            ..Mail::default()
        };
        let mc = MailConfig::resolve(&mail, |k| {
            match k {
                "MAILGUN_API_KEY" => Some("from-env".to_string()),
                _ => None,
            }
        })
        .unwrap();
        assert_eq!(mc.url.as_str(), "https://file.example.org/messages");
        assert_eq!(mc.api_key.as_deref(), Some("from-env"));
        assert_eq!(mc.from, DEFAULT_FROM);
    }

    #[test]
    fn missing_everything_falls_back() {
        let mc = MailConfig::resolve(&Mail::default(), |_| None).unwrap();
        assert_eq!(mc.url.as_str(), DEFAULT_MAIL_URL);
        assert_eq!(mc.api_key, None);
    }
}
