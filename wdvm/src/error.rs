use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no slot is currently READY to claim")]
    NoReadySlot,

    #[error("slot index {0} out of range")]
    BadSlot(usize),

    #[error("vmctl {0:?} exited with status {1}")]
    VmctlFailed(Vec<String>, std::process::ExitStatus),

    #[error("vmctl binary {0:?} failed to launch: {1}")]
    VmctlSpawn(PathBuf, std::io::Error),

    #[error(transparent)]
    Wire(#[from] wdlib::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
