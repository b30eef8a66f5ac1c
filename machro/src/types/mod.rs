//! Type integration with external types
//!
//! Implementation of [`Decode`][d] and conversion into [`Value`][v] for external types.
//!
//! Available for:
//!
//! - [`serde`]'s [`Deserialize`][sd] and [`Serialize`][ss] via [`Json`], requires `json` feature
//! - [`time`][::time]'s [`OffsetDateTime`][to], [`UtcDateTime`][tu], requires `time` feature
//!
//! [d]: crate::Decode
//! [v]: crate::Value
//! [sd]: serde::Deserialize
//! [ss]: serde::Serialize
//! [to]: ::time::OffsetDateTime
//! [tu]: ::time::UtcDateTime

#[cfg(feature = "json")]
mod json;
#[cfg(feature = "json")]
pub use json::Json;

#[cfg(feature = "time")]
mod time;
#[cfg(feature = "time")]
pub(crate) use self::time::parse_rfc3339;
