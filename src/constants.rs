//! Numeric values the host understands, mirrored into every script.

use rhai::INT;

pub const LOCAL_SCAN_ACCEPT: i32 = 0;
pub const LOCAL_SCAN_ACCEPT_FREEZE: i32 = 1;
pub const LOCAL_SCAN_ACCEPT_QUEUE: i32 = 2;
pub const LOCAL_SCAN_REJECT: i32 = 11;
pub const LOCAL_SCAN_REJECT_NOLOGHDR: i32 = 12;
pub const LOCAL_SCAN_TEMPREJECT: i32 = 13;
pub const LOCAL_SCAN_TEMPREJECT_NOLOGHDR: i32 = 14;

pub const LOG_MAIN: i32 = 1;
pub const LOG_PANIC: i32 = 2;
pub const LOG_REJECT: i32 = 16;

pub const D_V: i32 = 0x0000_0001;
pub const D_LOCAL_SCAN: i32 = 0x0000_0002;

pub const MESSAGE_ID_LENGTH: i32 = 16;
pub const SPOOL_DATA_START_OFFSET: i32 = MESSAGE_ID_LENGTH + 3;

/// Every constant a script can see, under the name it sees it by.
pub const SCRIPT_CONSTANTS: [(&str, i32); 14] = [
    ("LOCAL_SCAN_ACCEPT", LOCAL_SCAN_ACCEPT),
    ("LOCAL_SCAN_ACCEPT_FREEZE", LOCAL_SCAN_ACCEPT_FREEZE),
    ("LOCAL_SCAN_ACCEPT_QUEUE", LOCAL_SCAN_ACCEPT_QUEUE),
    ("LOCAL_SCAN_REJECT", LOCAL_SCAN_REJECT),
    ("LOCAL_SCAN_REJECT_NOLOGHDR", LOCAL_SCAN_REJECT_NOLOGHDR),
    ("LOCAL_SCAN_TEMPREJECT", LOCAL_SCAN_TEMPREJECT),
    ("LOCAL_SCAN_TEMPREJECT_NOLOGHDR", LOCAL_SCAN_TEMPREJECT_NOLOGHDR),
    ("LOG_MAIN", LOG_MAIN),
    ("LOG_PANIC", LOG_PANIC),
    ("LOG_REJECT", LOG_REJECT),
    ("D_v", D_V),
    ("D_local_scan", D_LOCAL_SCAN),
    ("MESSAGE_ID_LENGTH", MESSAGE_ID_LENGTH),
    ("SPOOL_DATA_START_OFFSET", SPOOL_DATA_START_OFFSET),
];

/// Iterate the constants as rhai integers.
pub fn script_constants() -> impl Iterator<Item = (&'static str, INT)> {
    SCRIPT_CONSTANTS
        .iter()
        .map(|&(name, value)| (name, INT::from(value)))
}

/// Human-readable name of a decision code, if it is one of ours.
pub fn decision_name(code: i32) -> Option<&'static str> {
    match code {
        LOCAL_SCAN_ACCEPT => Some("accept"),
        LOCAL_SCAN_ACCEPT_FREEZE => Some("accept-freeze"),
        LOCAL_SCAN_ACCEPT_QUEUE => Some("accept-queue"),
        LOCAL_SCAN_REJECT => Some("reject"),
        LOCAL_SCAN_REJECT_NOLOGHDR => Some("reject-nologhdr"),
        LOCAL_SCAN_TEMPREJECT => Some("tempreject"),
        LOCAL_SCAN_TEMPREJECT_NOLOGHDR => Some("tempreject-nologhdr"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_names_are_unique() {
        let mut names: Vec<&str> = SCRIPT_CONSTANTS.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SCRIPT_CONSTANTS.len());
    }

    #[test]
    fn test_decision_names() {
        assert_eq!(decision_name(LOCAL_SCAN_ACCEPT), Some("accept"));
        assert_eq!(decision_name(LOCAL_SCAN_TEMPREJECT), Some("tempreject"));
        assert_eq!(decision_name(42), None);
    }

    #[test]
    fn test_spool_offset_follows_message_id() {
        assert_eq!(SPOOL_DATA_START_OFFSET, 19);
    }
}
