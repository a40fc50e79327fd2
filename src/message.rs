use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;

/// Type tag the host treats as "drop this header when sending".
pub const HEADER_DELETED: char = '*';
/// Type tag of a header with no special meaning to the host.
pub const HEADER_OTHER: char = ' ';

/// One header line as the host keeps it. `text` includes the trailing newline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderLine {
    pub text: String,
    pub kind: char,
}

impl HeaderLine {
    pub fn new(kind: char, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == HEADER_DELETED
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub errors_to: Option<String>,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            errors_to: None,
        }
    }
}

/// Connection and envelope metadata the host exposes for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInfo {
    pub debug_selector: i32,
    pub host_checking: bool,
    pub interface_address: Option<String>,
    pub interface_port: i32,
    pub message_id: String,
    pub received_protocol: Option<String>,
    pub sender_address: String,
    pub sender_host_address: Option<String>,
    pub sender_host_authenticated: Option<String>,
    pub sender_host_name: Option<String>,
    pub sender_host_port: i32,
    /// Descriptor of the message body, `-1` when there is none.
    pub fd: RawFd,
}

impl Default for MessageInfo {
    fn default() -> Self {
        Self {
            debug_selector: 0,
            host_checking: false,
            interface_address: None,
            interface_port: 0,
            message_id: String::new(),
            received_protocol: None,
            sender_address: String::new(),
            sender_host_address: None,
            sender_host_authenticated: None,
            sender_host_name: None,
            sender_host_port: 0,
            fd: -1,
        }
    }
}

/// Host state for the message being scanned.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub headers: Vec<HeaderLine>,
    pub recipients: Vec<Recipient>,
    pub info: MessageInfo,
}

impl Message {
    pub fn recipient_addresses(&self) -> Vec<String> {
        self.recipients.iter().map(|r| r.address.clone()).collect()
    }

    /// Headers the host would still send, in order.
    pub fn live_headers(&self) -> impl Iterator<Item = &HeaderLine> {
        self.headers.iter().filter(|h| !h.is_deleted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_headers_skip_deleted() {
        let message = Message {
            headers: vec![
                HeaderLine::new('S', "Subject: one\n"),
                HeaderLine::new(HEADER_DELETED, "X-Spam: yes\n"),
                HeaderLine::new(HEADER_OTHER, "X-Note: kept\n"),
            ],
            ..Default::default()
        };

        let live: Vec<&str> = message.live_headers().map(|h| h.text.as_str()).collect();
        assert_eq!(live, vec!["Subject: one\n", "X-Note: kept\n"]);
    }

    #[test]
    fn test_recipient_addresses() {
        let message = Message {
            recipients: vec![Recipient::new("a@example.com"), Recipient::new("b@example.com")],
            ..Default::default()
        };
        assert_eq!(
            message.recipient_addresses(),
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
    }
}
