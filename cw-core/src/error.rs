//! Error types re-exported from cw-error.

pub use cw_error::{CorewatchError, Result};
