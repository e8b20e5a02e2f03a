//! Route handlers.
//!
//! Handlers stay thin: they decode the request, call into [`crate::auth`] and turn the
//! result into a response. Lockout, session and policy decisions never happen here.

pub mod auth;
pub mod health;
