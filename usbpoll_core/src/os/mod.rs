//! Readiness layer over asynchronous completion handles.
//!
//! The pieces, leaves first: completion events (`event`), transfer slots (`slot`), descriptor
//! records (`record`), the descriptor table (`table`), cancellation (`cancel`), signal pipes
//! (`pipe`) and the readiness waiter (`poller`). `device` is the seam to the native handle and
//! `loopback` an in-process endpoint standing in for the OS USB stack.

pub mod cancel;
pub mod device;
pub mod event;
pub mod interest;
pub mod loopback;
pub mod pipe;
pub mod poller;
pub mod record;
pub mod slot;
pub mod table;

pub use cancel::{Capabilities, CancellationStrategy, StrategyChoice};
pub use device::{Device, RawHandle};
#[cfg(unix)]
pub use device::FdDevice;
pub use event::CompletionEvent;
pub use interest::{Descriptor, Interest, WaitRequest};
pub use loopback::{LoopbackCaps, LoopbackDevice};
pub use record::{DescriptorRecord, TransferOutcome};
pub use slot::{Completion, TransferSlot, TransferStatus};
pub use table::DescriptorTable;
