//! A host for running the bridge outside the MTA: template expansion from
//! configured variables, host log lines routed to the `log` crate, and
//! re-injection through a configurable submission command.

use crate::child::{self, ChildError, ChildProcess, SpawnOptions};
use crate::config::StandaloneConfig;
use crate::constants::{LOG_PANIC, LOG_REJECT, MESSAGE_ID_LENGTH};
use crate::format::render_format;
use crate::host::HostServices;
use crate::message::{HeaderLine, HEADER_OTHER};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub struct StandaloneHost {
    reinject_command: Vec<String>,
    variables: BTreeMap<String, String>,
    variable_pattern: Regex,
}

impl StandaloneHost {
    pub fn new(config: &StandaloneConfig) -> anyhow::Result<Self> {
        let variable_pattern =
            Regex::new(r"\\\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")?;
        Ok(Self {
            reinject_command: config.reinject_command.clone(),
            variables: config.variables.clone(),
            variable_pattern,
        })
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<String>) {
        self.variables.insert(name.to_string(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}

impl HostServices for StandaloneHost {
    fn expand_string(&self, template: &str) -> Result<String, String> {
        let mut missing = None;
        let expanded = self
            .variable_pattern
            .replace_all(template, |caps: &Captures| {
                let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
                    return "$".to_string();
                };
                match self.variables.get(name.as_str()) {
                    Some(value) => value.clone(),
                    None => {
                        missing.get_or_insert_with(|| name.as_str().to_string());
                        String::new()
                    }
                }
            })
            .into_owned();

        match missing {
            Some(name) => Err(format!("unknown variable name \"{name}\"")),
            None => Ok(expanded),
        }
    }

    fn log_write(&self, selector: i32, format: &str) {
        let text = render_format(format);
        let text = text.trim_end_matches('\n');
        if selector & LOG_PANIC != 0 {
            log::error!(target: "exim", "{text}");
        } else if selector & LOG_REJECT != 0 {
            log::warn!(target: "exim", "{text}");
        } else {
            log::info!(target: "exim", "{text}");
        }
    }

    fn debug_printf(&self, format: &str) {
        log::debug!(target: "exim", "{}", render_format(format).trim_end_matches('\n'));
    }

    fn child_open_exim(
        &self,
        sender: &str,
        sender_auth: Option<&str>,
    ) -> Result<ChildProcess, ChildError> {
        let mut argv = self.reinject_command.clone();
        argv.push("-f".to_string());
        argv.push(sender.to_string());
        if let Some(auth) = sender_auth {
            argv.push("-oMas".to_string());
            argv.push(auth.to_string());
        }
        log::debug!("Re-injecting message: {}", argv.join(" "));
        child::open(&argv, &SpawnOptions::default())
    }
}

/// A message read from a file, split into header lines and body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub headers: Vec<HeaderLine>,
    /// Envelope sender from `Return-Path`, if the file carries one.
    pub return_path: Option<String>,
    pub body: String,
}

/// The type tag the MTA gives a header when it receives it.
pub fn header_kind(name: &str) -> char {
    match name.to_ascii_lowercase().as_str() {
        "bcc" => 'B',
        "cc" => 'C',
        "from" => 'F',
        "message-id" => 'I',
        "received" => 'P',
        "reply-to" => 'R',
        "sender" => 'S',
        "to" => 'T',
        _ => HEADER_OTHER,
    }
}

fn push_header(headers: &mut Vec<HeaderLine>, text: String) {
    let name = text.split(':').next().unwrap_or_default().trim();
    headers.push(HeaderLine::new(header_kind(name), text));
}

/// Split an RFC 5322 message into header lines (folded lines kept with
/// their header) and body. Line endings are normalized to `\n`.
pub fn parse_message(content: &str) -> ParsedMessage {
    let content = content.replace("\r\n", "\n");
    let mut parsed = ParsedMessage::default();
    let mut current: Option<String> = None;
    let mut rest = content.as_str();

    while !rest.is_empty() {
        let (line, remainder) = match rest.find('\n') {
            Some(pos) => (&rest[..=pos], &rest[pos + 1..]),
            None => (rest, ""),
        };
        rest = remainder;

        if line.trim_end_matches('\n').is_empty() {
            parsed.body = remainder.to_string();
            break;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(header) = current.as_mut() {
                header.push_str(line);
                continue;
            }
        }

        if let Some(header) = current.take() {
            push_header(&mut parsed.headers, header);
        }

        let mut text = line.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        current = Some(text);
    }

    if let Some(header) = current.take() {
        push_header(&mut parsed.headers, header);
    }

    parsed.return_path = parsed
        .headers
        .iter()
        .find(|h| h.text.to_ascii_lowercase().starts_with("return-path:"))
        .and_then(|h| h.text.split_once(':'))
        .map(|(_, value)| value.trim().trim_matches(['<', '>']).to_string());

    parsed
}

fn base62(mut value: u64, width: usize) -> String {
    let mut digits = vec![b'0'; width];
    for slot in digits.iter_mut().rev() {
        *slot = BASE62[(value % 62) as usize];
        value /= 62;
    }
    String::from_utf8_lossy(&digits).into_owned()
}

/// A message id in the MTA's `tttttt-pppppp-ss` layout.
pub fn message_id(now: SystemTime, pid: u32) -> String {
    let elapsed = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let id = format!(
        "{}-{}-{}",
        base62(elapsed.as_secs(), 6),
        base62(u64::from(pid), 6),
        base62(u64::from(elapsed.subsec_millis()), 2)
    );
    debug_assert_eq!(id.len(), MESSAGE_ID_LENGTH as usize);
    id
}

/// Contents of a spool data file: the id line, then the body. The body
/// starts at `SPOOL_DATA_START_OFFSET`.
pub fn spool_data(message_id: &str, body: &str) -> String {
    format!("{message_id}-D\n{body}")
}

/// An anonymous file holding the body in spool layout, rewound to the
/// start. It has no name on disk, so nothing is left behind when it closes.
pub fn spool_file(message_id: &str, body: &str) -> io::Result<File> {
    let mut file = tempfile::tempfile()?;
    file.write_all(spool_data(message_id, body).as_bytes())?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}
