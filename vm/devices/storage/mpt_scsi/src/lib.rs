// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SCSI host for LSI Fusion-MPT IOCs: IO submission and completion, and the
//! error recovery ladder of task management and IOC resets.
//!
//! The host sits on top of a base driver, reached through [`MptAdapter`],
//! which owns the PCI function and the message frame FIFOs. The OS queues
//! [`ScsiCmd`]s with [`ScsiHost::queue_command`] and gets each result back on
//! a channel; the base driver feeds replies in with
//! [`ScsiHost::handle_reply`].

#![forbid(unsafe_code)]

mod adapter;
mod chain;
mod cmd;
mod host;
mod internal;
mod io_done;
mod lookup;
mod memory;
mod mgmt;
mod ratelimit;
mod sgl;
mod taskmgmt;

#[cfg(feature = "test")]
pub mod test_helpers;

#[cfg(all(test, not(feature = "test")))]
mod test_helpers;

#[cfg(test)]
mod tests;

pub use adapter::AdapterError;
pub use adapter::BusType;
pub use adapter::FrameRelease;
pub use adapter::IocFacts;
pub use adapter::MessageFrame;
pub use adapter::MptAdapter;
pub use adapter::ReplyContext;
pub use adapter::MSG_CONTEXT_OFFSET;
pub use adapter::PCI_VENDOR_ID_IBM;
pub use chain::ChainPool;
pub use cmd::CmdError;
pub use cmd::CompletionReceiver;
pub use cmd::DataDirection;
pub use cmd::DeviceConfig;
pub use cmd::HostStatus;
pub use cmd::ScsiCmd;
pub use cmd::ScsiCompletion;
pub use cmd::ScsiDevice;
pub use cmd::ScsiResult;
pub use cmd::ScsiTarget;
pub use cmd::SgEntry;
pub use cmd::TargetConfig;
pub use host::HostInitError;
pub use host::HostStats;
pub use host::QueueError;
pub use host::ResetKind;
pub use host::ResetPhase;
pub use host::ScsiHost;
pub use host::ScsiHostConfig;
pub use internal::InternalCmd;
pub use internal::InternalCmdError;
pub use internal::InternalCmdFlags;
pub use internal::InternalCompletion;
pub use internal::InternalOutcome;
pub use lookup::LookupError;
pub use lookup::LookupTable;
pub use memory::MemoryBlock;
pub use sgl::build_sgl;
pub use sgl::SglError;
pub use taskmgmt::RecoveryError;
pub use taskmgmt::TaskMgmtError;
