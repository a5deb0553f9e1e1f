use smol_str::SmolStr;
use thiserror::Error;

use crate::lua_value::LuaValue;
use crate::lua_vm::lua_limits::{HARD_TIMEOUT_MESSAGE, SOFT_TIMEOUT_MESSAGE};

/// Which of the two instruction limits was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Soft,
    Hard,
}

impl TimeoutStage {
    pub fn message(self) -> &'static str {
        match self {
            TimeoutStage::Soft => SOFT_TIMEOUT_MESSAGE,
            TimeoutStage::Hard => HARD_TIMEOUT_MESSAGE,
        }
    }

    /// Recognizes the error object raised by the timeout hook.
    pub fn from_error_value(value: &LuaValue) -> Option<Self> {
        let text = value.as_bytes()?;
        if text == SOFT_TIMEOUT_MESSAGE.as_bytes() {
            Some(TimeoutStage::Soft)
        } else if text == HARD_TIMEOUT_MESSAGE.as_bytes() {
            Some(TimeoutStage::Hard)
        } else {
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum LuaError {
    /// A value could not cross the boundary.
    #[error("cannot marshal value: {0}")]
    Marshal(String),
    /// An error object raised by script code (or by a native function).
    #[error("{}", script_error_text(.0))]
    Script(LuaValue),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("not enough memory")]
    ResourceExhausted,
    #[error("{}", .0.message())]
    Timeout(TimeoutStage),
    /// The host object behind a userdata is gone.
    #[error("attempt to use a disconnected {0}")]
    Disconnected(SmolStr),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("machine is executing and cannot be closed")]
    MachineBusy,
    #[error("machine is closed")]
    MachineClosed,
}

pub type LuaResult<T> = Result<T, LuaError>;

fn script_error_text(value: &LuaValue) -> String {
    match value {
        LuaValue::String(s) => s.to_string_lossy().into_owned(),
        LuaValue::Integer(_) | LuaValue::Number(_) => value.to_string(),
        other => format!("(error object is a {} value)", other.type_name()),
    }
}

impl LuaError {
    /// A script-visible runtime error carrying `message`.
    pub fn runtime(message: impl Into<String>) -> Self {
        LuaError::Script(LuaValue::from(message.into()))
    }

    /// `bad argument #n (expected, got)` in the usual Lua wording.
    pub fn bad_argument(position: usize, expected: &str, got: &LuaValue) -> Self {
        LuaError::runtime(format!(
            "bad argument #{} ({} expected, got {})",
            position,
            expected,
            got.type_name()
        ))
    }

    /// The value raised inside the VM when this error crosses into script code.
    pub fn to_error_value(&self) -> LuaValue {
        match self {
            LuaError::Script(value) => value.clone(),
            other => LuaValue::from(other.to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LuaError::Timeout(_))
    }
}
