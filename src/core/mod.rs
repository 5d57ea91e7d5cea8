//! Core types shared by every component: the error taxonomy and its
//! user-facing rendering.

pub mod error;

pub use error::{ErrorContext, UpdaterError, user_friendly_error};
