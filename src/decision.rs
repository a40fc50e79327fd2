use crate::constants::decision_name;
use rhai::Dynamic;
use serde::Serialize;
use std::fmt;

/// What the bridge hands back to the host for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub code: i32,
    pub return_text: Option<String>,
}

impl Verdict {
    pub fn new(code: i32, return_text: Option<String>) -> Self {
        Self { code, return_text }
    }

    pub fn name(&self) -> &'static str {
        decision_name(self.code).unwrap_or("custom")
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code)?;
        if let Some(text) = &self.return_text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

/// Decode an entry point's return value.
///
/// A non-empty array contributes its first element as the code and, when
/// present, its second element (stringified) as the return text. Anything
/// else is taken as the code itself. The code must be an integer that fits
/// the host's `int`; on failure the reason is returned.
pub fn decode(value: Dynamic) -> Result<Verdict, String> {
    let value = value.flatten();

    let (code, text) = if value.is_array() {
        let mut items = value
            .into_array()
            .map_err(|type_name| format!("unexpected {type_name}"))?
            .into_iter();
        match items.next() {
            Some(first) => (first.flatten(), items.next().map(|second| second.to_string())),
            None => return Err("returned an empty array".to_string()),
        }
    } else {
        (value, None)
    };

    let type_name = code.type_name();
    let code = code
        .as_int()
        .map_err(|_| format!("returned {type_name} where an integer was expected"))?;
    let code = i32::try_from(code).map_err(|_| format!("return code {code} is out of range"))?;

    Ok(Verdict::new(code, text))
}
