use std::io;

use thiserror::Error;

/// Errors reported by descriptor builders and install operations.
///
/// Builder operations are transactional: when one of these is returned,
/// the descriptor is exactly as it was before the call.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No event with the given system/name is known to the [`EventDb`][crate::event::EventDb].
    #[error("no such event: {0}")]
    NoSuchEvent(String),

    /// A field (or histogram variable) name did not resolve.
    #[error("no such field: {0}")]
    NoSuchField(String),

    /// Match or compare fields differ in size or flags.
    #[error("incompatible fields: {0} and {1}")]
    IncompatibleFields(String, String),

    /// The descriptor is missing a part required for installation,
    /// such as the end event of a synthetic pair.
    #[error("descriptor is not fully configured")]
    NotConfigured,

    /// A field size the synthetic-event protocol cannot express.
    #[error("unsupported field size: {0}")]
    BadFormat(u32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
