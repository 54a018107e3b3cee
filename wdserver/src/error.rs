#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] wdlib::Error),

    #[error(transparent)]
    Vm(#[from] wdvm::Error),

    #[error("no backend key {0} is live")]
    UnknownKey(u32),

    #[error("a SENDFILE was received before the connection was initialized, and one is already pending")]
    DuplicatePendingArchive,

    #[error(transparent)]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Errno(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
