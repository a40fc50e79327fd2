//! Per-message header arena and the proxies scripts hold into it.
//!
//! While a message is being scanned its header list lives here instead of
//! in the host's [`Message`](crate::message::Message). Proxies carry the
//! generation they were created in; every open and close bumps the
//! generation, so a proxy that outlives its message can never reach the
//! headers of another one.

use crate::error::{BridgeError, EngineResult};
use crate::message::{HeaderLine, HEADER_OTHER};
use rhai::{Dynamic, Engine, INT};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MessageSession {
    generation: u64,
    open: bool,
    headers: Vec<HeaderLine>,
    debug_selector: i32,
}

impl MessageSession {
    fn check(&self, generation: u64) -> Result<(), BridgeError> {
        if self.open && self.generation == generation {
            Ok(())
        } else {
            Err(BridgeError::StaleHandle)
        }
    }

    fn line(&self, slot: usize, generation: u64) -> Result<&HeaderLine, BridgeError> {
        self.check(generation)?;
        self.headers.get(slot).ok_or(BridgeError::StaleHandle)
    }

    fn line_mut(&mut self, slot: usize, generation: u64) -> Result<&mut HeaderLine, BridgeError> {
        self.check(generation)?;
        self.headers.get_mut(slot).ok_or(BridgeError::StaleHandle)
    }
}

/// Handle to the session shared by the engine's host functions and the scanner.
#[derive(Debug, Clone, Default)]
pub struct SharedSession(Arc<Mutex<MessageSession>>);

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MessageSession> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership of a message's headers for the length of one scan.
    /// Any session still open is closed first and its headers dropped.
    pub fn open(&self, headers: Vec<HeaderLine>, debug_selector: i32) -> u64 {
        let mut session = self.lock();
        if session.open {
            log::warn!("Header session was still open, discarding it");
        }
        session.generation += 1;
        session.open = true;
        session.headers = headers;
        session.debug_selector = debug_selector;
        session.generation
    }

    /// Invalidate every proxy of the current generation and hand the
    /// (possibly modified) headers back. Returns `None` when nothing was open.
    pub fn close(&self) -> Option<Vec<HeaderLine>> {
        let mut session = self.lock();
        if !session.open {
            return None;
        }
        session.open = false;
        session.generation += 1;
        session.debug_selector = 0;
        Some(mem::take(&mut session.headers))
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn debug_enabled(&self) -> bool {
        let session = self.lock();
        session.open && session.debug_selector != 0
    }

    /// Proxies for every header currently in the session.
    pub fn proxies(&self) -> Vec<HeaderProxy> {
        let session = self.lock();
        if !session.open {
            return Vec::new();
        }
        (0..session.headers.len())
            .map(|slot| HeaderProxy {
                session: self.clone(),
                slot: Some(slot),
                generation: session.generation,
            })
            .collect()
    }

    /// Append a header to the open message.
    pub fn add_header(&self, text: String) -> Result<(), BridgeError> {
        let mut session = self.lock();
        if !session.open {
            return Err(BridgeError::StaleHandle);
        }
        session.headers.push(HeaderLine::new(HEADER_OTHER, text));
        Ok(())
    }
}

/// Script-visible view of one header line.
#[derive(Debug, Clone)]
pub struct HeaderProxy {
    session: SharedSession,
    slot: Option<usize>,
    generation: u64,
}

impl HeaderProxy {
    fn slot(&self) -> Result<usize, BridgeError> {
        self.slot.ok_or(BridgeError::StaleHandle)
    }

    pub fn text(&self) -> Result<String, BridgeError> {
        let slot = self.slot()?;
        let session = self.session.lock();
        Ok(session.line(slot, self.generation)?.text.clone())
    }

    pub fn kind(&self) -> Result<char, BridgeError> {
        let slot = self.slot()?;
        let session = self.session.lock();
        Ok(session.line(slot, self.generation)?.kind)
    }

    /// Change the type tag. The value must be a single printable ASCII character.
    pub fn set_kind(&self, value: &str) -> Result<(), BridgeError> {
        let slot = self.slot()?;
        let mut chars = value.chars();
        let kind = match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii() && !c.is_ascii_control() => c,
            _ => {
                return Err(BridgeError::InvalidAssignment(
                    "header.type can only be set to a single-character value".to_string(),
                ))
            }
        };
        let mut session = self.session.lock();
        session.line_mut(slot, self.generation)?.kind = kind;
        Ok(())
    }

    /// Drop the back-reference. Idempotent.
    pub fn invalidate(&mut self) {
        self.slot = None;
    }

    pub fn is_valid(&self) -> bool {
        match self.slot {
            Some(slot) => self.session.lock().line(slot, self.generation).is_ok(),
            None => false,
        }
    }
}

fn get_text(header: &mut HeaderProxy) -> EngineResult<String> {
    header.text().map_err(BridgeError::into_script_error)
}

fn get_type(header: &mut HeaderProxy) -> EngineResult<String> {
    header
        .kind()
        .map(String::from)
        .map_err(BridgeError::into_script_error)
}

fn set_type(header: &mut HeaderProxy, value: Dynamic) -> EngineResult<()> {
    let value = value.into_immutable_string().map_err(|actual| {
        BridgeError::InvalidAssignment(format!(
            "header.type can only be set to a single-character value, not {actual}"
        ))
        .into_script_error()
    })?;
    header
        .set_kind(value.as_str())
        .map_err(BridgeError::into_script_error)
}

fn set_text(_header: &mut HeaderProxy, _value: Dynamic) -> EngineResult<()> {
    Err(BridgeError::InvalidAssignment("Attribute: text is not settable".to_string()).into_script_error())
}

fn index_get(header: &mut HeaderProxy, index: INT) -> EngineResult<String> {
    match index {
        0 => get_text(header),
        1 => get_type(header),
        _ => Err(format!("header index {index} out of range, use 0 (text) or 1 (type)").into()),
    }
}

fn to_string(header: &mut HeaderProxy) -> String {
    match header.text() {
        Ok(text) => text.trim_end_matches('\n').to_string(),
        Err(_) => "<stale header>".to_string(),
    }
}

fn to_debug(header: &mut HeaderProxy) -> String {
    match (header.kind(), header.text()) {
        (Ok(kind), Ok(text)) => format!("HeaderLine({kind:?}, {text:?})"),
        _ => "HeaderLine(<stale>)".to_string(),
    }
}

/// Teach an engine about [`HeaderProxy`].
pub fn register_header_type(engine: &mut Engine) {
    engine
        .register_type_with_name::<HeaderProxy>("HeaderLine")
        .register_get("text", get_text)
        .register_set("text", set_text)
        .register_get("type", get_type)
        .register_set("type", set_type)
        .register_indexer_get(index_get)
        .register_fn("is_valid", |header: &mut HeaderProxy| header.is_valid())
        .register_fn("to_string", to_string)
        .register_fn("to_debug", to_debug);
}
