//! Call-protocol wire types.

use crate::error::RemoteError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A function as a transmissible value: a registered name plus bound arguments.
///
/// Both sides must have registered the same name (see [`crate::registry`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callable {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl Callable {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Build a callable from any serializable argument value.
    pub fn with_args<T: Serialize + ?Sized>(
        name: impl Into<String>,
        args: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(name, serde_json::to_value(args)?))
    }
}

/// One step of a call exchange.
///
/// `NestedCall` asks the receiver to run the enclosed callable locally and
/// answer with exactly one `Result` or `Exception` before the original
/// request's answer arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Message {
    Result(Value),
    Exception(RemoteError),
    NestedCall(Callable),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Result(_) => "result",
            Message::Exception(_) => "exception",
            Message::NestedCall(_) => "nested_call",
        }
    }
}

/// Handshake sent to a task worker started with fork+exec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TaskBoot {
    pub name: String,
    pub entry: Callable,
    pub read_fd: i32,
    pub write_fd: i32,
    #[serde(default)]
    pub verbose: bool,
}
