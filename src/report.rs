//! Selecting, projecting and rendering quota records.
use std::fmt::Write;
use std::str::FromStr;

use serde_json::{Map, Value};
use tabled::builder::Builder;
use tabled::settings::Style;

use fs_quota::QuotaRecord;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Records that are over quota. A record without a percentage never is.
pub fn filter_over_quota(records: &[QuotaRecord]) -> Vec<QuotaRecord> {
    records.iter().filter(|r| r.is_over_quota()).cloned().collect()
}

/// Bytes to GiB, two decimals.
pub fn to_gb(bytes: u64) -> f64 {
    (bytes as f64 / GIB * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    User,
    Path,
    Filesystem,
    BlocksUsed,
    BlocksSoft,
    BlocksHard,
    BlocksGrace,
    FilesUsed,
    FilesSoft,
    FilesHard,
    FilesGrace,
    BlocksPct,
    FilesPct,
}

impl Field {
    pub fn key(&self) -> &'static str {
        match self {
            Field::User => "user",
            Field::Path => "path",
            Field::Filesystem => "filesystem",
            Field::BlocksUsed => "blocks_used",
            Field::BlocksSoft => "blocks_soft",
            Field::BlocksHard => "blocks_hard",
            Field::BlocksGrace => "blocks_grace_days",
            Field::FilesUsed => "files_used",
            Field::FilesSoft => "files_soft",
            Field::FilesHard => "files_hard",
            Field::FilesGrace => "files_grace_days",
            Field::BlocksPct => "blocks_pct",
            Field::FilesPct => "files_pct",
        }
    }

    fn is_bytes(&self) -> bool {
        matches!(self, Field::BlocksUsed | Field::BlocksSoft | Field::BlocksHard)
    }

    fn value(&self, r: &QuotaRecord) -> Value {
        match self {
            Field::User => Value::from(r.user.as_str()),
            Field::Path => Value::from(r.path.display().to_string()),
            Field::Filesystem => Value::from(r.filesystem.as_str()),
            Field::BlocksUsed => Value::from(r.blocks_used),
            Field::BlocksSoft => Value::from(r.blocks_soft),
            Field::BlocksHard => Value::from(r.blocks_hard),
            Field::BlocksGrace => Value::from(r.blocks_grace_days),
            Field::FilesUsed => Value::from(r.files_used),
            Field::FilesSoft => Value::from(r.files_soft),
            Field::FilesHard => Value::from(r.files_hard),
            Field::FilesGrace => Value::from(r.files_grace_days),
            Field::BlocksPct => Value::from(r.blocks_pct),
            Field::FilesPct => Value::from(r.files_pct),
        }
    }
}

/// A projected record, field key -> value.
pub type Row = Map<String, Value>;

/// Project records onto `fields`. Byte counts come out in GiB.
pub fn filter_fields(records: &[QuotaRecord], fields: &[Field]) -> Vec<Row> {
    records
        .iter()
        .map(|r| {
            fields
                .iter()
                .map(|f| {
                    let v = if f.is_bytes() {
                        let bytes = f.value(r).as_u64().unwrap_or(0);
                        Value::from(to_gb(bytes))
                    } else {
                        f.value(r)
                    };
                    (f.key().to_string(), v)
                })
                .collect()
        })
        .collect()
}

/// Project records onto `fields` as they are.
pub fn raw_fields(records: &[QuotaRecord], fields: &[Field]) -> Vec<Row> {
    records
        .iter()
        .map(|r| fields.iter().map(|f| (f.key().to_string(), f.value(r))).collect())
        .collect()
}

pub const SHORT: [(Field, &str); 5] = [
    (Field::User, "User"),
    (Field::Path, "Path"),
    (Field::BlocksPct, "Quota Used (%)"),
    (Field::BlocksUsed, "Blocks Used (GB)"),
    (Field::FilesUsed, "Total Files (#)"),
];

pub const FULL: [(Field, &str); 13] = [
    (Field::User, "User"),
    (Field::Path, "Path"),
    (Field::Filesystem, "Fs"),
    (Field::BlocksUsed, "Used (Bytes)"),
    (Field::BlocksSoft, "Soft (Bytes)"),
    (Field::BlocksHard, "Hard (Bytes)"),
    (Field::BlocksGrace, "Grace (Days)"),
    (Field::FilesUsed, "Files (N)"),
    (Field::FilesSoft, "Soft (N)"),
    (Field::FilesHard, "Hard (N)"),
    (Field::FilesGrace, "Grace (Days)"),
    (Field::BlocksPct, "Bytes (%)"),
    (Field::FilesPct, "Files (%)"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Short,
    Full,
}

impl FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<ReportKind, String> {
        match s {
            "short" | "single" => Ok(ReportKind::Short),
            "full" => Ok(ReportKind::Full),
            other => Err(format!("unknown report type {:?} (short, full)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Simple,
    Plain,
    Github,
    Psql,
    Grid,
    Rounded,
    Html,
    Json,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Format, String> {
        match s {
            "simple" => Ok(Format::Simple),
            "plain" => Ok(Format::Plain),
            "github" | "markdown" => Ok(Format::Github),
            "psql" => Ok(Format::Psql),
            "grid" => Ok(Format::Grid),
            "rounded" => Ok(Format::Rounded),
            "html" => Ok(Format::Html),
            "json" => Ok(Format::Json),
            other => Err(format!("unknown output format {:?}", other)),
        }
    }
}

pub fn short_report(records: &[QuotaRecord], fmt: Format) -> String {
    let fields: Vec<Field> = SHORT.iter().map(|(f, _)| *f).collect();
    render(&filter_fields(records, &fields), &SHORT, fmt)
}

pub fn full_report(records: &[QuotaRecord], fmt: Format) -> String {
    let fields: Vec<Field> = FULL.iter().map(|(f, _)| *f).collect();
    render(&raw_fields(records, &fields), &FULL, fmt)
}

pub fn report(records: &[QuotaRecord], kind: ReportKind, fmt: Format) -> String {
    match kind {
        ReportKind::Short => short_report(records, fmt),
        ReportKind::Full => full_report(records, fmt),
    }
}

fn cell(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn render(rows: &[Row], columns: &[(Field, &str)], fmt: Format) -> String {
    match fmt {
        Format::Json => serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string()),
        Format::Html => html_table(rows, columns),
        _ => {
            let mut builder = Builder::default();
            builder.push_record(columns.iter().map(|(_, h)| h.to_string()));
            for row in rows {
                builder.push_record(columns.iter().map(|(f, _)| cell(row.get(f.key()))));
            }
            let mut table = builder.build();
            match fmt {
                Format::Simple => table.with(Style::blank()),
                Format::Plain => table.with(Style::empty()),
                Format::Github => table.with(Style::markdown()),
                Format::Psql => table.with(Style::psql()),
                Format::Grid => table.with(Style::ascii()),
                _ => table.with(Style::rounded()),
            };
            table.to_string()
        },
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn html_table(rows: &[Row], columns: &[(Field, &str)]) -> String {
    let mut out = String::from("<table>\n<thead>\n<tr>");
    for (_, h) in columns {
        let _ = write!(out, "<th>{}</th>", escape(h));
    }
    out.push_str("</tr>\n</thead>\n<tbody>\n");
    for row in rows {
        out.push_str("<tr>");
        for (f, _) in columns {
            let _ = write!(out, "<td>{}</td>", escape(&cell(row.get(f.key()))));
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</tbody>\n</table>");
    out
}
