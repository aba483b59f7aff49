// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions from the LSI Fusion-MPT Message Passing Interface (MPI 1.5).
//!
//! Only the messages used by the SCSI initiator host are described here: SCSI
//! IO, task management, SCSI enclosure processor, RAID action and event
//! notification, plus the simple and chain scatter-gather element encodings.
//! All fields are little-endian on the wire.

#![no_std]

pub mod scsi;

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Declares an integer newtype with named associated values. Values outside
/// the named set are preserved and print as raw numbers.
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $vis:vis enum $name:ident: $ty:ty {
            $($(#[$va:meta])* $variant:ident = $value:expr,)*
        }
    ) => {
        $(#[$a])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
        #[repr(transparent)]
        $vis struct $name(pub $ty);

        #[allow(missing_docs)]
        impl $name {
            $($(#[$va])* pub const $variant: $name = $name($value);)*
        }

        impl core::fmt::Debug for $name {
            #[allow(unreachable_patterns)]
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                let s = match *self {
                    $(Self::$variant => stringify!($variant),)*
                    _ => return write!(f, "{}({:#x})", stringify!($name), self.0),
                };
                f.pad(s)
            }
        }
    };
}

/// The MPI version at which the high priority request queue and task
/// management response codes were introduced.
pub const MPI_VERSION_01_05: u16 = 0x0105;

/// Size of the per-request sense buffer carved out by the host.
pub const SENSE_BUFFER_ALLOC: usize = 64;

/// Sense length advertised in SCSI IO requests.
pub const SENSE_BUFFER_SIZE: u8 = 64;

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum Function: u8 {
        SCSI_IO_REQUEST = 0x00,
        SCSI_TASK_MGMT = 0x01,
        IOC_INIT = 0x02,
        IOC_FACTS = 0x03,
        CONFIG = 0x04,
        PORT_FACTS = 0x05,
        PORT_ENABLE = 0x06,
        EVENT_NOTIFICATION = 0x07,
        EVENT_ACK = 0x08,
        FW_DOWNLOAD = 0x09,
        TARGET_CMD_BUFFER_POST = 0x0A,
        TARGET_ASSIST = 0x0B,
        TARGET_STATUS_SEND = 0x0C,
        TARGET_MODE_ABORT = 0x0D,
        FC_LINK_SRVC_BUF_POST = 0x0E,
        FC_LINK_SRVC_RSP = 0x0F,
        FC_EX_LINK_SRVC_SEND = 0x10,
        FC_ABORT = 0x11,
        FW_UPLOAD = 0x12,
        FC_COMMON_TRANSPORT_SEND = 0x13,
        FC_PRIMITIVE_SEND = 0x14,
        RAID_ACTION = 0x15,
        RAID_SCSI_IO_PASSTHROUGH = 0x16,
        TOOLBOX = 0x17,
        SCSI_ENCLOSURE_PROCESSOR = 0x18,
        MAILBOX = 0x19,
        SMP_PASSTHROUGH = 0x1A,
        SAS_IO_UNIT_CONTROL = 0x1B,
        SCSI_IO_32 = 0x1E,
    }
}

open_enum! {
    /// The 15-bit IOC status carried in every reply, with the log info flag
    /// already stripped. Use [`IocStatus::from_reply`] on raw reply values.
    pub enum IocStatus: u16 {
        SUCCESS = 0x0000,
        INVALID_FUNCTION = 0x0001,
        BUSY = 0x0002,
        INVALID_SGL = 0x0003,
        INTERNAL_ERROR = 0x0004,
        RESERVED = 0x0005,
        INSUFFICIENT_RESOURCES = 0x0006,
        INVALID_FIELD = 0x0007,
        INVALID_STATE = 0x0008,
        OP_STATE_NOT_SUPPORTED = 0x0009,

        SCSI_RECOVERED_ERROR = 0x0040,
        SCSI_INVALID_BUS = 0x0041,
        SCSI_INVALID_TARGETID = 0x0042,
        SCSI_DEVICE_NOT_THERE = 0x0043,
        SCSI_DATA_OVERRUN = 0x0044,
        SCSI_DATA_UNDERRUN = 0x0045,
        SCSI_IO_DATA_ERROR = 0x0046,
        SCSI_PROTOCOL_ERROR = 0x0047,
        SCSI_TASK_TERMINATED = 0x0048,
        SCSI_RESIDUAL_MISMATCH = 0x0049,
        SCSI_TASK_MGMT_FAILED = 0x004A,
        SCSI_IOC_TERMINATED = 0x004B,
        SCSI_EXT_TERMINATED = 0x004C,

        EEDP_GUARD_ERROR = 0x004D,
        EEDP_REF_TAG_ERROR = 0x004E,
        EEDP_APP_TAG_ERROR = 0x004F,
    }
}

impl IocStatus {
    pub const MASK: u16 = 0x7FFF;
    pub const FLAG_LOG_INFO_AVAILABLE: u16 = 0x8000;

    /// Strips the log info flag from a raw reply status.
    pub const fn from_reply(raw: u16) -> Self {
        Self(raw & Self::MASK)
    }

    /// Whether the raw reply status says the log info word is meaningful.
    pub const fn log_info_available(raw: u16) -> bool {
        raw & Self::FLAG_LOG_INFO_AVAILABLE != 0
    }
}

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum ScsiStatus: u8 {
        SUCCESS = 0x00,
        CHECK_CONDITION = 0x02,
        CONDITION_MET = 0x04,
        BUSY = 0x08,
        INTERMEDIATE = 0x10,
        INTERMEDIATE_CONDMET = 0x14,
        RESERVATION_CONFLICT = 0x18,
        COMMAND_TERMINATED = 0x22,
        TASK_SET_FULL = 0x28,
        ACA_ACTIVE = 0x30,
        FCPEXT_DEVICE_LOGGED_OUT = 0x80,
        FCPEXT_NO_LINK = 0x84,
        FCPEXT_UNASSIGNED = 0x88,
    }
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct ScsiState {
    pub autosense_valid: bool,
    pub autosense_failed: bool,
    pub no_scsi_status: bool,
    pub terminated: bool,
    pub response_info_valid: bool,
    pub queue_tag_rejected: bool,
    #[bits(2)]
    _reserved: u8,
}

/// The message context stamped into every request by the message frame
/// allocator and echoed back in the matching reply.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct MsgContext {
    pub req_idx: u16,
    pub cb_idx: u8,
    _reserved: u8,
}

/// The system doorbell register.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Doorbell {
    /// Fault code when the state is [`IocState::FAULT`].
    pub data: u16,
    _reserved: u8,
    #[bits(3)]
    pub who_init: u8,
    pub active: bool,
    #[bits(4)]
    state_bits: u8,
}

impl Doorbell {
    pub fn state(&self) -> IocState {
        IocState(u32::from(self.state_bits()) << 28)
    }
}

open_enum! {
    pub enum IocState: u32 {
        RESET = 0x0000_0000,
        READY = 0x1000_0000,
        OPERATIONAL = 0x2000_0000,
        FAULT = 0x4000_0000,
    }
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct IocCapabilities {
    pub high_pri_q: bool,
    pub reply_host_signal: bool,
    pub qfull_handling: bool,
    pub diag_trace_buffer: bool,
    pub snapshot_buffer: bool,
    pub extended_buffer: bool,
    pub eedp: bool,
    #[bits(25)]
    _reserved: u32,
}

// Data direction and queue type bits of the SCSI IO `control` word.
pub const SCSIIO_CONTROL_NODATATRANSFER: u32 = 0x0000_0000;
pub const SCSIIO_CONTROL_WRITE: u32 = 0x0100_0000;
pub const SCSIIO_CONTROL_READ: u32 = 0x0200_0000;
pub const SCSIIO_CONTROL_DATADIRECTION_MASK: u32 = 0x0300_0000;
pub const SCSIIO_CONTROL_SIMPLEQ: u32 = 0x0000_0000;
pub const SCSIIO_CONTROL_HEADOFQ: u32 = 0x0000_0100;
pub const SCSIIO_CONTROL_ORDEREDQ: u32 = 0x0000_0200;
pub const SCSIIO_CONTROL_UNTAGGED: u32 = 0x0000_0500;

/// Common header of every request message frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RequestHeader {
    pub reserved: u16,
    pub chain_offset: u8,
    pub function: Function,
    pub reserved1: [u8; 3],
    pub msg_flags: u8,
    pub msg_context: MsgContext,
}

/// Byte offset of `chain_offset` within any request frame.
pub const REQUEST_CHAIN_OFFSET: usize = 2;

/// Common header of every reply message frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DefaultReply {
    pub reserved1: u16,
    pub msg_length: u8,
    pub function: Function,
    pub reserved2: u16,
    pub reserved3: u8,
    pub msg_flags: u8,
    pub msg_context: MsgContext,
    pub reserved4: u16,
    pub ioc_status: u16,
    pub ioc_log_info: u32,
}

/// SCSI IO request header. The scatter-gather list follows at
/// [`SCSI_IO_SGL_OFFSET`].
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ScsiIoRequest {
    pub target_id: u8,
    pub bus: u8,
    pub chain_offset: u8,
    pub function: Function,
    pub cdb_length: u8,
    pub sense_buffer_length: u8,
    pub reserved: u8,
    pub msg_flags: u8,
    pub msg_context: MsgContext,
    pub lun: [u8; 8],
    pub control: u32,
    pub cdb: [u8; 16],
    pub data_length: u32,
    pub sense_buffer_low_addr: u32,
}

pub const SCSI_IO_SGL_OFFSET: usize = size_of::<ScsiIoRequest>();

const _: () = assert!(SCSI_IO_SGL_OFFSET == 48);

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ScsiIoReply {
    pub target_id: u8,
    pub bus: u8,
    pub msg_length: u8,
    pub function: Function,
    pub cdb_length: u8,
    pub sense_buffer_length: u8,
    pub reserved: u8,
    pub msg_flags: u8,
    pub msg_context: MsgContext,
    pub scsi_status: ScsiStatus,
    pub scsi_state: ScsiState,
    pub ioc_status: u16,
    pub ioc_log_info: u32,
    pub transfer_count: u32,
    pub sense_count: u32,
    pub response_info: u32,
    pub task_tag: u16,
    pub reserved1: u16,
}

const _: () = assert!(size_of::<ScsiIoReply>() == 36);

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum TaskType: u8 {
        ABORT_TASK = 0x01,
        ABORT_TASK_SET = 0x02,
        TARGET_RESET = 0x03,
        RESET_BUS = 0x04,
        LOGICAL_UNIT_RESET = 0x05,
        CLEAR_TASK_SET = 0x06,
        QUERY_TASK = 0x07,
        CLR_ACA = 0x08,
    }
}

/// Task management `msg_flags`: issue a LIP as part of a bus reset (FC).
pub const TASKMGMT_MSGFLAGS_LIPRESET_RESET_OPTION: u8 = 0x04;

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ScsiTaskMgmt {
    pub target_id: u8,
    pub bus: u8,
    pub chain_offset: u8,
    pub function: Function,
    pub reserved: u8,
    pub task_type: TaskType,
    pub reserved1: u8,
    pub msg_flags: u8,
    pub msg_context: MsgContext,
    pub lun: [u8; 8],
    pub reserved2: [u32; 7],
    pub task_msg_context: u32,
}

const _: () = assert!(size_of::<ScsiTaskMgmt>() == 52);

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum TaskMgmtResponse: u8 {
        TASK_MGMT_COMPLETE = 0x00,
        INVALID_FRAME = 0x02,
        TASK_MGMT_NOT_SUPPORTED = 0x04,
        TASK_MGMT_FAILED = 0x05,
        TASK_MGMT_SUCCEEDED = 0x08,
        INVALID_LUN = 0x09,
        TASK_QUEUED_ON_IOC = 0x80,
    }
}

impl TaskMgmtResponse {
    pub fn description(self) -> &'static str {
        match self {
            Self::TASK_MGMT_COMPLETE => "TM completed",
            Self::INVALID_FRAME => "invalid frame",
            Self::TASK_MGMT_NOT_SUPPORTED => "TM not supported",
            Self::TASK_MGMT_FAILED => "TM failed",
            Self::TASK_MGMT_SUCCEEDED => "TM succeeded",
            Self::INVALID_LUN => "invalid lun",
            Self::TASK_QUEUED_ON_IOC => "task queued on IOC",
            _ => "unrecognized",
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ScsiTaskMgmtReply {
    pub target_id: u8,
    pub bus: u8,
    pub msg_length: u8,
    pub function: Function,
    pub response_code: TaskMgmtResponse,
    pub task_type: TaskType,
    pub reserved1: u8,
    pub msg_flags: u8,
    pub msg_context: MsgContext,
    pub reserved2: u16,
    pub ioc_status: u16,
    pub ioc_log_info: u32,
    pub termination_count: u32,
}

const _: () = assert!(size_of::<ScsiTaskMgmtReply>() == 24);

pub const SEP_REQ_ACTION_WRITE_STATUS: u8 = 0x00;
pub const SEP_REQ_ACTION_READ_STATUS: u8 = 0x01;

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct SepSlotStatus {
    pub no_error: bool,
    pub dev_faulty: bool,
    pub dev_rebuilding: bool,
    pub in_failed_array: bool,
    pub in_critical_array: bool,
    pub parity_check: bool,
    pub predicted_fault: bool,
    pub unconfigured: bool,
    pub hot_spare: bool,
    pub rebuild_stopped: bool,
    #[bits(22)]
    _reserved: u32,
}

/// SCSI enclosure processor request, used to drive per-slot status LEDs.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SepRequest {
    pub target_id: u8,
    pub bus: u8,
    pub chain_offset: u8,
    pub function: Function,
    pub action: u8,
    pub flags: u8,
    pub reserved1: u8,
    pub msg_flags: u8,
    pub msg_context: MsgContext,
    pub slot_status: SepSlotStatus,
    pub reserved2: u32,
    pub reserved3: u32,
    pub reserved4: u32,
    pub slot: u16,
    pub enclosure_handle: u16,
}

const _: () = assert!(size_of::<SepRequest>() == 32);

pub const RAID_ACTION_QUIESCE_PHYS_IO: u8 = 0x1B;
pub const RAID_ACTION_ENABLE_PHYS_IO: u8 = 0x1C;
pub const RAID_ACTION_STATUS_SUCCESS: u16 = 0x0000;

/// RAID action request header. The action data SGE follows at
/// [`RAID_ACTION_SGE_OFFSET`].
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RaidActionRequest {
    pub action: u8,
    pub reserved1: u8,
    pub chain_offset: u8,
    pub function: Function,
    pub volume_id: u8,
    pub volume_bus: u8,
    pub phys_disk_num: u8,
    pub msg_flags: u8,
    pub msg_context: MsgContext,
    pub reserved2: u32,
    pub action_data_word: u32,
}

pub const RAID_ACTION_SGE_OFFSET: usize = size_of::<RaidActionRequest>();

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RaidActionReply {
    pub action: u8,
    pub reserved: u8,
    pub msg_length: u8,
    pub function: Function,
    pub volume_id: u8,
    pub volume_bus: u8,
    pub phys_disk_num: u8,
    pub msg_flags: u8,
    pub msg_context: MsgContext,
    pub action_status: u16,
    pub ioc_status: u16,
    pub ioc_log_info: u32,
    pub volume_status: u32,
    pub action_data: u32,
}

open_enum! {
    pub enum Event: u8 {
        NONE = 0x00,
        LOG_DATA = 0x01,
        STATE_CHANGE = 0x02,
        UNIT_ATTENTION = 0x03,
        IOC_BUS_RESET = 0x04,
        EXT_BUS_RESET = 0x05,
        RESCAN = 0x06,
        LINK_STATUS_CHANGE = 0x07,
        LOOP_STATE_CHANGE = 0x08,
        LOGOUT = 0x09,
        EVENT_CHANGE = 0x0A,
        INTEGRATED_RAID = 0x0B,
        SCSI_DEVICE_STATUS_CHANGE = 0x0C,
        ON_BUS_TIMER_EXPIRED = 0x0D,
        QUEUE_FULL = 0x0E,
        SAS_DEVICE_STATUS_CHANGE = 0x0F,
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EventNotificationReply {
    pub event_data_length: u16,
    pub msg_length: u8,
    pub function: Function,
    pub reserved1: u16,
    pub ack_required: u8,
    pub msg_flags: u8,
    pub msg_context: MsgContext,
    pub reserved2: u16,
    pub ioc_status: u16,
    pub ioc_log_info: u32,
    pub event: u32,
    pub event_context: u32,
}

impl EventNotificationReply {
    pub fn event(&self) -> Event {
        Event(self.event as u8)
    }
}

/// SAS IOC log info codes. Only the type/originator/code portion is compared.
pub const SAS_LOGINFO_MASK: u32 = 0xFFFF_0000;
pub const SAS_LOGINFO_NEXUS_LOSS: u32 = 0x3117_0000;

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct SgeFlags {
    pub end_of_list: bool,
    pub address_64: bool,
    pub host_to_ioc: bool,
    pub local_address: bool,
    #[bits(2)]
    pub element_type: u8,
    pub end_of_buffer: bool,
    pub last_element: bool,
}

impl SgeFlags {
    pub const ELEMENT_TYPE_SIMPLE: u8 = 1;
    pub const ELEMENT_TYPE_CHAIN: u8 = 3;

    /// Positions the flags in the top byte of a simple element's
    /// `flags_length` word.
    pub const fn shifted(self) -> u32 {
        (self.into_bits() as u32) << 24
    }
}

/// Flag words for simple elements, already shifted into `flags_length`.
pub const SGE_FLAGS_LAST_ELEMENT: u32 = 0x80 << 24;
pub const SGE_FLAGS_END_OF_BUFFER: u32 = 0x40 << 24;
pub const SGE_FLAGS_SIMPLE_ELEMENT: u32 = 0x10 << 24;
pub const SGE_FLAGS_CHAIN_ELEMENT: u32 = 0x30 << 24;
pub const SGE_FLAGS_HOST_TO_IOC: u32 = 0x04 << 24;
pub const SGE_FLAGS_IOC_TO_HOST: u32 = 0x00;
pub const SGE_FLAGS_64_BIT_ADDRESSING: u32 = 0x02 << 24;
pub const SGE_FLAGS_END_OF_LIST: u32 = 0x01 << 24;

/// A terminating zero-length simple element in the read direction.
pub const SGE_FLAGS_SSIMPLE_READ: u32 = SGE_FLAGS_LAST_ELEMENT
    | SGE_FLAGS_END_OF_BUFFER
    | SGE_FLAGS_END_OF_LIST
    | SGE_FLAGS_SIMPLE_ELEMENT
    | SGE_FLAGS_IOC_TO_HOST;
pub const SGE_FLAGS_SSIMPLE_WRITE: u32 = SGE_FLAGS_LAST_ELEMENT
    | SGE_FLAGS_END_OF_BUFFER
    | SGE_FLAGS_END_OF_LIST
    | SGE_FLAGS_SIMPLE_ELEMENT
    | SGE_FLAGS_HOST_TO_IOC;

/// Address placed in a null element.
pub const SGE_NULL_ADDRESS: u64 = 0xFFFF_FFFF;

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SgeSimple32 {
    pub flags_length: u32,
    pub address: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SgeSimple64 {
    pub flags_length: u32,
    pub address_low: u32,
    pub address_high: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SgeChain32 {
    pub length: u16,
    pub next_chain_offset: u8,
    pub flags: SgeFlags,
    pub address: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SgeChain64 {
    pub length: u16,
    pub next_chain_offset: u8,
    pub flags: SgeFlags,
    pub address_low: u32,
    pub address_high: u32,
}

/// Largest encoded element, simple or chain.
pub const SGE_MAX_SIZE: usize = size_of::<SgeSimple64>();

/// The address width of scatter-gather elements negotiated with the IOC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SgeFormat {
    Sge32,
    Sge64,
}

/// An encoded element, ready to be copied into a frame or chain buffer.
#[derive(Copy, Clone, Debug)]
pub struct EncodedSge {
    buf: [u8; SGE_MAX_SIZE],
    len: u8,
}

impl EncodedSge {
    fn new(bytes: &[u8]) -> Self {
        let mut buf = [0; SGE_MAX_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            buf,
            len: bytes.len() as u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

impl SgeFormat {
    /// The size of one element in this format. Simple and chain elements
    /// have the same size.
    pub const fn element_size(self) -> usize {
        match self {
            SgeFormat::Sge32 => size_of::<SgeSimple32>(),
            SgeFormat::Sge64 => size_of::<SgeSimple64>(),
        }
    }

    /// Encodes a simple element. `flags_length` carries the flags in the top
    /// byte and the byte count in the low 24 bits.
    pub fn simple(self, flags_length: u32, address: u64) -> EncodedSge {
        match self {
            SgeFormat::Sge32 => EncodedSge::new(
                SgeSimple32 {
                    flags_length,
                    address: address as u32,
                }
                .as_bytes(),
            ),
            SgeFormat::Sge64 => EncodedSge::new(
                SgeSimple64 {
                    flags_length: flags_length | SGE_FLAGS_64_BIT_ADDRESSING,
                    address_low: address as u32,
                    address_high: (address >> 32) as u32,
                }
                .as_bytes(),
            ),
        }
    }

    /// Encodes a chain element pointing at `length` bytes of elements at
    /// `address`. `next_chain_offset` is the word offset of the next chain
    /// element within the pointed-to buffer, or zero if there is none.
    pub fn chain(self, next_chain_offset: u8, length: u16, address: u64) -> EncodedSge {
        let flags = SgeFlags::new().with_element_type(SgeFlags::ELEMENT_TYPE_CHAIN);
        match self {
            SgeFormat::Sge32 => EncodedSge::new(
                SgeChain32 {
                    length,
                    next_chain_offset,
                    flags,
                    address: address as u32,
                }
                .as_bytes(),
            ),
            SgeFormat::Sge64 => EncodedSge::new(
                SgeChain64 {
                    length,
                    next_chain_offset,
                    flags: flags.with_address_64(true),
                    address_low: address as u32,
                    address_high: (address >> 32) as u32,
                }
                .as_bytes(),
            ),
        }
    }
}

/// Encodes a LUN in the SAM single level format used by request frames.
pub fn lun_bytes(lun: u64) -> [u8; 8] {
    let mut bytes = [0; 8];
    let mut lun = lun;
    for pair in bytes.chunks_exact_mut(2) {
        pair[0] = (lun >> 8) as u8;
        pair[1] = lun as u8;
        lun >>= 16;
    }
    bytes
}
