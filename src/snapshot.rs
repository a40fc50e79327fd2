//! Builds the per-message namespace a script sees as `this`.

use crate::constants::script_constants;
use crate::message::MessageInfo;
use crate::session::{HeaderProxy, SharedSession};
use rhai::{Array, Dynamic, Map, INT};

/// Namespace keys owned by the bridge.
pub const HEADERS_KEY: &str = "headers";
pub const RECIPIENTS_KEY: &str = "recipients";

/// A freshly built namespace plus the recipient list it started from.
pub struct Snapshot {
    pub namespace: Dynamic,
    pub original_recipients: Vec<String>,
}

fn optional(value: &Option<String>) -> Dynamic {
    match value {
        Some(text) => Dynamic::from(text.clone()),
        None => Dynamic::UNIT,
    }
}

fn scalars(info: &MessageInfo, map: &mut Map) {
    map.insert("debug_selector".into(), Dynamic::from(INT::from(info.debug_selector)));
    map.insert("host_checking".into(), Dynamic::from(info.host_checking));
    map.insert("interface_address".into(), optional(&info.interface_address));
    map.insert("interface_port".into(), Dynamic::from(INT::from(info.interface_port)));
    map.insert("message_id".into(), Dynamic::from(info.message_id.clone()));
    map.insert("received_protocol".into(), optional(&info.received_protocol));
    map.insert("sender_address".into(), Dynamic::from(info.sender_address.clone()));
    map.insert("sender_host_address".into(), optional(&info.sender_host_address));
    map.insert(
        "sender_host_authenticated".into(),
        optional(&info.sender_host_authenticated),
    );
    map.insert("sender_host_name".into(), optional(&info.sender_host_name));
    map.insert("sender_host_port".into(), Dynamic::from(INT::from(info.sender_host_port)));
    map.insert("fd".into(), Dynamic::from(INT::from(info.fd)));
}

/// Project the open session's headers, the recipients and the message
/// metadata into a fresh object map. The session must already hold this
/// message's headers.
pub fn build(session: &SharedSession, recipients: &[String], info: &MessageInfo) -> Snapshot {
    let mut map = Map::new();

    for (name, value) in script_constants() {
        map.insert(name.into(), Dynamic::from(value));
    }
    scalars(info, &mut map);

    let headers: Array = session
        .proxies()
        .into_iter()
        .map(Dynamic::from::<HeaderProxy>)
        .collect();
    map.insert(HEADERS_KEY.into(), Dynamic::from_array(headers));

    let working: Array = recipients
        .iter()
        .map(|address| Dynamic::from(address.clone()))
        .collect();
    map.insert(RECIPIENTS_KEY.into(), Dynamic::from_array(working));

    Snapshot {
        namespace: Dynamic::from_map(map),
        original_recipients: recipients.to_vec(),
    }
}

/// Take the script's `recipients` binding back out of a finished namespace.
pub fn take_recipients(namespace: Dynamic) -> Option<Dynamic> {
    let mut map = namespace.try_cast::<Map>()?;
    map.remove(RECIPIENTS_KEY)
}
