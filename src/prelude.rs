// prelude.rs - Convenient re-exports.
//
//! # Prelude
//!
//! ```
//! use evrex::prelude::*;
//!
//! let mut re = Regex::new(r"[0-9]+").unwrap();
//! assert_eq!(re.match_from("answer: 42", 8), Some("42".to_string()));
//! ```

pub use crate::api::{Regex, RegexBuilder};
pub use crate::error::{CompileError, RuntimeError};
