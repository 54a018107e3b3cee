use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown handle")]
    UnknownHandle,

    #[error("negative or out of range position")]
    InvalidPosition,

    #[error("position overflows platform maximum")]
    Overflow,

    #[error("label of length {0} exceeds MAXNAMESIZE ({MAXNAMESIZE})")]
    LabelTooLong(usize),

    #[error("data of length {0} exceeds MAXFILESIZE ({MAXFILESIZE})")]
    DataTooLong(usize),

    #[error("opcode byte on the wire does not match the cached opcode")]
    OpcodeMismatch,

    #[error("message bytes are not valid utf8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("message bytes are truncated, more data expected")]
    Truncated,

    #[error("ipc payload is missing its NUL terminator")]
    NotNulTerminated,

    #[error("name of length {0} exceeds MAXNAMESIZE ({MAXNAMESIZE})")]
    NameTooLong(usize),

    #[error("id space exhausted")]
    IdSpaceExhausted,

    #[error("this opcode does not carry a label")]
    NoLabel,

    #[error("this opcode does not carry data")]
    NoData,
}

pub const MAXNAMESIZE: usize = 1024;
pub const MAXFILESIZE: usize = 10_485_760;

pub type Result<T> = std::result::Result<T, Error>;
