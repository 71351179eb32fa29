pub mod config;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod os;

pub use config::PollConfig;
pub use error::{Error, Result};
pub use os::{
    Completion, Descriptor, DescriptorTable, Device, Interest, LoopbackCaps, LoopbackDevice, TransferOutcome,
    TransferStatus, WaitRequest,
};
