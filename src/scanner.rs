use crate::config::BridgeConfig;
use crate::constants::{LOCAL_SCAN_ACCEPT, LOG_REJECT};
use crate::decision::{self, Verdict};
use crate::engine::ScriptEngine;
use crate::error::BridgeError;
use crate::format::format_safe;
use crate::host::HostServices;
use crate::message::Message;
use crate::recipients;
use crate::session::SharedSession;
use crate::snapshot::{self, Snapshot};
use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Runs the configured scan function once per message and turns the
/// outcome into a decision for the host.
pub struct LocalScanner {
    config: BridgeConfig,
    services: Arc<dyn HostServices>,
    session: SharedSession,
    engine: Mutex<ScriptEngine>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl LocalScanner {
    pub fn new(config: BridgeConfig, services: Arc<dyn HostServices>) -> Self {
        let session = SharedSession::new();
        let engine = ScriptEngine::new(&config, Arc::clone(&services), session.clone());
        Self {
            config,
            services,
            session,
            engine: Mutex::new(engine),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn lock_engine(&self) -> MutexGuard<'_, ScriptEngine> {
        self.engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Build the engine and import the scan module without scanning anything.
    /// Returns the path the module was loaded from.
    pub fn prepare(&self) -> Result<PathBuf, BridgeError> {
        let mut engine = self.lock_engine();
        engine.ensure_ready()?;
        engine.ensure_user_module()?;
        engine.module_path().cloned().ok_or_else(|| BridgeError::ModuleImport {
            module: self.config.scan_module.clone(),
            reason: "module is not loaded".to_string(),
        })
    }

    /// Scan one message. Never fails: every bridge-level problem becomes
    /// the configured failure decision.
    pub fn scan(&self, message: &mut Message) -> Verdict {
        if !self.config.enabled {
            return Verdict::new(LOCAL_SCAN_ACCEPT, None);
        }

        let mut engine = self.lock_engine();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(&mut engine, message)));

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                self.restore_headers(message);
                Err(BridgeError::Panic(panic_message(payload.as_ref())))
            }
        };

        match result {
            Ok(verdict) => {
                log::debug!("Message {} scanned: {verdict}", message.info.message_id);
                verdict
            }
            Err(err) => self.failure(&message.info.message_id, err),
        }
    }

    fn run(&self, engine: &mut ScriptEngine, message: &mut Message) -> Result<Verdict, BridgeError> {
        engine.ensure_ready()?;
        engine.ensure_user_module()?;

        let headers = mem::take(&mut message.headers);
        self.session.open(headers, message.info.debug_selector);

        let Snapshot {
            mut namespace,
            original_recipients,
        } = snapshot::build(
            &self.session,
            &message.recipient_addresses(),
            &message.info,
        );

        let returned = match engine.invoke(&mut namespace) {
            Ok(value) => value,
            Err(err) => {
                self.restore_headers(message);
                return Err(err);
            }
        };

        let working = recipients::working_list(snapshot::take_recipients(namespace));
        let changes = recipients::reconcile(
            &mut message.recipients,
            &original_recipients,
            working.as_deref(),
        );
        if !changes.is_empty() {
            log::debug!(
                "Recipients of {} changed: removed {:?}, added {:?}",
                message.info.message_id,
                changes.removed,
                changes.added
            );
        }

        self.restore_headers(message);

        decision::decode(returned).map_err(|reason| BridgeError::Decode {
            function: engine.scan_function().to_string(),
            reason,
        })
    }

    /// Close the session, which invalidates every proxy handed out for this
    /// message, and give the headers back to the message.
    fn restore_headers(&self, message: &mut Message) {
        if let Some(headers) = self.session.close() {
            message.headers = headers;
        }
    }

    fn failure(&self, message_id: &str, err: BridgeError) -> Verdict {
        let line = format!("local_scan bridge: {err}");
        self.services.log_write(LOG_REJECT, &format_safe(&line, false));
        log::error!("Scan of message {message_id} failed: {err}");

        Verdict::new(
            self.config.failure_policy.decision_code(),
            Some(err.return_text().to_string()),
        )
    }
}
