pub mod error;
pub mod message;
pub mod pool;
pub mod vmctl;

pub use error::{Error, Result};
pub use pool::{Dispatch, HeartbeatAction, ReapResult, SlotState, VmEvent, VmPool, VmPoolConfig};
