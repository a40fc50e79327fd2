use rhai::EvalAltResult;

pub(crate) type EngineResult<T> = Result<T, Box<EvalAltResult>>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("script engine initialization failed: {0}")]
    EngineInit(String),
    #[error("couldn't import script module '{module}': {reason}")]
    ModuleImport { module: String, reason: String },
    #[error("script module {module} doesn't have a {function}() function")]
    MissingEntryPoint { module: String, function: String },
    #[error("script function {function} failed: {reason}")]
    ScriptRuntime { function: String, reason: String },
    #[error("script function {function} didn't return an integer: {reason}")]
    Decode { function: String, reason: String },
    #[error("Header object no longer valid, held over from previously processed message?")]
    StaleHandle,
    #[error("{0}")]
    InvalidAssignment(String),
    #[error("local_scan bridge panicked: {0}")]
    Panic(String),
}

impl BridgeError {
    /// Text handed back to the host alongside the failure decision.
    pub fn return_text(&self) -> &'static str {
        match self {
            BridgeError::EngineInit(_) => "Internal error, can't initialize script engine",
            BridgeError::ModuleImport { .. } => "Internal error, can't import local_scan module",
            BridgeError::MissingEntryPoint { .. } => {
                "Internal error, module doesn't have local_scan function"
            }
            BridgeError::ScriptRuntime { .. } => "Internal error, local_scan function failed",
            BridgeError::Decode { .. } => "Internal error, bad return code",
            BridgeError::Panic(_) => "Internal error, local_scan bridge panicked",
            BridgeError::StaleHandle | BridgeError::InvalidAssignment(_) => {
                "Internal error, local_scan function failed"
            }
        }
    }

    /// Raise this error inside a running script.
    pub(crate) fn into_script_error(self) -> Box<EvalAltResult> {
        self.to_string().into()
    }
}
