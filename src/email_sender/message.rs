//! RFC 5322 / MIME rendering of a single [`Mail`].

use super::filename::normalize;
use super::{EmailError, Mail};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Local};
use rand::RngCore;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_CHARSET: &str = "utf-8";

/// RFC 2045 caps encoded lines at 76 characters.
const BASE64_LINE: usize = 76;

/// A fully rendered message, ready for `DATA` or an `.eml` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    bytes: Vec<u8>,
}

impl RenderedMessage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Renders `mail` with the current local time and a fresh boundary.
///
/// Attachments are read from disk on every call.
pub fn build(mail: &Mail) -> Result<RenderedMessage, EmailError> {
    let boundary = loop {
        let candidate = random_boundary();
        if !mail.text.contains(&candidate) {
            break candidate;
        }
    };
    build_with(mail, Local::now(), boundary)
}

pub(crate) fn build_with(
    mail: &Mail,
    date: DateTime<Local>,
    boundary: String,
) -> Result<RenderedMessage, EmailError> {
    let charset = mail.charset();
    let mut out = String::new();

    header(&mut out, "From", &mail.sender);
    if !mail.reply_to.is_empty() {
        header(&mut out, "Reply-To", &mail.reply_to);
    }
    header(&mut out, "Date", &rfc1123z(&date));
    if !mail.to.is_empty() {
        header(&mut out, "To", &mail.to.join(";"));
    }
    if !mail.cc.is_empty() {
        header(&mut out, "Cc", &mail.cc.join(";"));
    }
    header(&mut out, "Subject", &mail.subject);
    header(&mut out, "MIME-Version", "1.0");
    header(&mut out, "User-Agent", USER_AGENT);
    header(
        &mut out,
        "Content-Type",
        &format!("multipart/mixed; charset=\"{charset}\"; boundary=\"{boundary}\""),
    );
    header(&mut out, "Content-Disposition", "inline");
    out.push_str("\r\n");

    // inline body
    let _ = write!(out, "--{boundary}\r\n");
    header(
        &mut out,
        "Content-Type",
        &format!("text/plain; charset=\"{charset}\""),
    );
    header(&mut out, "Content-Disposition", "inline");
    out.push_str("\r\n");
    out.push_str(&mail.text);

    for attachment in &mail.attachments {
        let data = fs::read(&attachment.path).map_err(|source| EmailError::Attachment {
            path: attachment.path.display().to_string(),
            source,
        })?;
        let attachment_charset = if attachment.charset.is_empty() {
            charset
        } else {
            attachment.charset.as_str()
        };

        let _ = write!(out, "\r\n--{boundary}\r\n");
        header(
            &mut out,
            "Content-Type",
            &format!("{}; charset=\"{}\"", attachment.content_type, attachment_charset),
        );
        header(&mut out, "Content-Transfer-Encoding", "base64");
        header(
            &mut out,
            "Content-Disposition",
            &format!("attachment; filename=\"{}\"", file_name(&attachment.path)),
        );
        out.push_str("\r\n");
        push_base64(&mut out, &data);
    }

    let _ = write!(out, "\r\n--{boundary}--\r\n");

    Ok(RenderedMessage {
        bytes: out.into_bytes(),
    })
}

fn header(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, "{name}: {value}\r\n");
}

/// `Mon, 02 Jan 2006 15:04:05 -0700`
fn rfc1123z(date: &DateTime<Local>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

fn push_base64(out: &mut String, data: &[u8]) {
    let encoded = STANDARD.encode(data);
    let mut lines = encoded.as_bytes().chunks(BASE64_LINE).peekable();
    while let Some(line) = lines.next() {
        // base64 output is ASCII
        out.push_str(std::str::from_utf8(line).unwrap_or_default());
        if lines.peek().is_some() {
            out.push_str("\r\n");
        }
    }
}

/// Normalized base name, safe inside a quoted header parameter.
fn file_name(path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    let mut quoted = String::with_capacity(base.len());
    for c in normalize(&base).chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\r' | '\n' => quoted.push('_'),
            _ => quoted.push(c),
        }
    }
    quoted
}

fn random_boundary() -> String {
    let mut raw = [0u8; 30];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().fold(String::with_capacity(60), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
