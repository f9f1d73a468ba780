pub mod assert;
pub mod script;
pub mod types;

pub use script::ScriptBridge;
pub use types::{BridgeError, ENTRY_POINT};
