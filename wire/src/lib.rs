//! Client/server frame types and the error taxonomy for the puzzle hub's
//! wire protocol: JSON payloads carried inside length-delimited frames.

mod error;
mod frame;

pub use error::RouterError;
pub use frame::{ClientFrame, EventKind, Op, ServerFrame, WireError};
