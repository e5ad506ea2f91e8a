//! Common imports and types used throughout cassiad.

pub use std::sync::{Arc, Condvar, Mutex};

pub type Result<T> = std::result::Result<T, crate::core::errors::CoreError>;
