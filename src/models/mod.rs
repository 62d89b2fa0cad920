//! Data models shared across the crate.
//!
//! Wire-level request/response shapes live next to the code that sends
//! them; only types that cross module boundaries belong here.

pub mod user;

pub use user::UserProfile;
