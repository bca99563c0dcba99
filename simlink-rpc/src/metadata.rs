//! Call metadata.
//!
//! Every call made through the dispatcher carries a [`CallMetadata`] as its
//! first argument. On the wire it is a one-element array, `[false]` for a
//! call whose result the caller waits for and `[true]` for fire-and-forget.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[bool; 1]", into = "[bool; 1]")]
pub struct CallMetadata {
    asynchronous_call: bool,
}

impl CallMetadata {
    #[must_use]
    pub const fn synchronous() -> Self {
        Self {
            asynchronous_call: false,
        }
    }

    #[must_use]
    pub const fn asynchronous() -> Self {
        Self {
            asynchronous_call: true,
        }
    }

    /// Server side: whether the result should be discarded
    #[must_use]
    pub const fn is_response_ignored(&self) -> bool {
        self.asynchronous_call
    }

    #[must_use]
    pub fn to_value(self) -> Value {
        Value::Array(vec![Value::Bool(self.asynchronous_call)])
    }
}

impl From<[bool; 1]> for CallMetadata {
    fn from([asynchronous_call]: [bool; 1]) -> Self {
        Self { asynchronous_call }
    }
}

impl From<CallMetadata> for [bool; 1] {
    fn from(metadata: CallMetadata) -> Self {
        [metadata.asynchronous_call]
    }
}
