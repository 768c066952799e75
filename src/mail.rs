//
// Outgoing mail through an HTTP mail API (mailgun style).
//
use std::time::Duration;

use reqwest::blocking::Client;

use crate::config::MailConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to:      String,
    pub subject: String,
    pub html:    String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("no API key present - did you set MAILGUN_API_KEY in your environment?")]
    MissingCredential,
    #[error("sending mail: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mail endpoint answered {0}")]
    Rejected(u16),
}

pub trait Mailer {
    fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Posts a form with `subject`, `from`, `to` and `html` using basic auth
/// `api:<key>`.
pub struct MailgunMailer {
    client:  Client,
    config:  MailConfig,
    api_key: String,
}

impl MailgunMailer {
    pub fn new(config: MailConfig) -> Result<MailgunMailer, MailError> {
        let api_key = match config.api_key {
            Some(ref k) => k.clone(),
            None => return Err(MailError::MissingCredential),
        };
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(MailgunMailer {
            client,
            config,
            api_key,
        })
    }
}

impl Mailer for MailgunMailer {
    fn send(&self, email: &Email) -> Result<(), MailError> {
        let form = [
            ("subject", email.subject.as_str()),
            ("from", self.config.from.as_str()),
            ("to", email.to.as_str()),
            ("html", email.html.as_str()),
        ];
        let resp = self
            .client
            .post(self.config.url.clone())
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()?;
        let status = resp.status();
        info!("Response code is {}", status.as_u16());
        if status.is_success() {
            Ok(())
        } else {
            Err(MailError::Rejected(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use url::Url;

    // Answer one request per status with `Connection: close`, returning the
    // raw requests.
    fn serve(statuses: &'static [u16]) -> (Url, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = Url::parse(&format!("http://{}/v3/messages", listener.local_addr().unwrap())).unwrap();
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for status in statuses {
                let (mut conn, _) = listener.accept().unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                // headers first, then as much body as content-length says.
                let body_start = loop {
                    let n = conn.read(&mut chunk).unwrap();
                    assert!(n > 0, "connection closed early");
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..body_start]).to_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .map(|v| v.trim().parse::<usize>().unwrap())
                    .unwrap_or(0);
                while buf.len() < body_start + len {
                    let n = conn.read(&mut chunk).unwrap();
                    assert!(n > 0, "connection closed early");
                    buf.extend_from_slice(&chunk[..n]);
                }
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                conn.write_all(reply.as_bytes()).unwrap();
                requests.push(String::from_utf8_lossy(&buf).into_owned());
            }
            requests
        });
        (url, handle)
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let config = MailConfig {
            url:     Url::parse("https://mail.example.org/messages").unwrap(),
            api_key: None,
            from:    "<noreply@example.org>".to_string(),
        };
        assert!(matches!(MailgunMailer::new(config), Err(MailError::MissingCredential)));
    }

    #[test]
    fn mailer_with_key() {
        let config = MailConfig {
            url:     Url::parse("https://mail.example.org/messages").unwrap(),
            api_key: Some("key-123".to_string()),
            from:    "<noreply@example.org>".to_string(),
        };
        let mailer = MailgunMailer::new(config).unwrap();
        assert_eq!(mailer.api_key, "key-123");
    }

    #[test]
    fn posts_a_form_and_maps_the_status() {
        let (url, server) = serve(&[200, 500]);
        let mut mailer = MailgunMailer::new(MailConfig {
            url,
            api_key: Some("key-123".to_string()),
            from: "<noreply@example.org>".to_string(),
        })
        .unwrap();
        // talk to the local listener even when a proxy is set in the environment.
        mailer.client = Client::builder().no_proxy().build().unwrap();
        let email = Email {
            to:      "alice@example.org".to_string(),
            subject: "Over quota".to_string(),
            html:    "<p>hi</p>".to_string(),
        };

        mailer.send(&email).unwrap();
        assert!(matches!(mailer.send(&email), Err(MailError::Rejected(500))));

        let requests = server.join().unwrap();
        assert_eq!(requests.len(), 2);
        let req = &requests[0];
        assert!(req.starts_with("POST /v3/messages HTTP/1.1\r\n"));
        let lower = req.to_lowercase();
        assert!(lower.contains("authorization: basic yxbpomtles0xmjm=\r\n"));
        assert!(lower.contains("content-type: application/x-www-form-urlencoded"));
        assert!(req.contains("subject=Over+quota"));
        assert!(req.contains("from=%3Cnoreply%40example.org%3E"));
        assert!(req.contains("to=alice%40example.org"));
        assert!(req.contains("html=%3Cp%3Ehi%3C%2Fp%3E"));
    }
}
