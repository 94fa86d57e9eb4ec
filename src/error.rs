use crate::dataplane::MappingKind;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{kind} pool exhausted")]
    Exhausted { kind: MappingKind },

    #[error("no {kind} mapping for external id {external_aux}")]
    MappingNotFound {
        kind: MappingKind,
        external_aux: u16,
    },

    #[error("{0} mappings do not track connections")]
    UnsupportedKind(MappingKind),
}

pub type Result<T> = std::result::Result<T, Error>;
