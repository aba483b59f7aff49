// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SCSI command set values referenced by the host.

use crate::open_enum;

open_enum! {
    pub enum ScsiOp: u8 {
        TEST_UNIT_READY = 0x00,
        REQUEST_SENSE = 0x03,
        READ6 = 0x08,
        WRITE6 = 0x0A,
        INQUIRY = 0x12,
        RESERVE_UNIT = 0x16,
        RELEASE_UNIT = 0x17,
        START_STOP_UNIT = 0x1B,
        READ = 0x28,
        WRITE = 0x2A,
        VERIFY = 0x2F,
        SYNCHRONIZE_CACHE = 0x35,
        WRITE_DATA_BUFF = 0x3B,
        READ_DATA_BUFF = 0x3C,
        READ16 = 0x88,
        WRITE16 = 0x8A,
        VERIFY16 = 0x8F,
        SERVICE_ACTION_IN16 = 0x9E,
        REPORT_LUNS = 0xA0,
        READ12 = 0xA8,
        WRITE12 = 0xAA,
        /// Vendor command that enables FC transport layer retries.
        TRANSPORT_LAYER_RETRIES = 0xC2,
    }
}

impl ScsiOp {
    /// Reads and verifies whose length bookkeeping the LSI53C1030 can
    /// corrupt on underrun.
    pub fn is_read_or_verify(self) -> bool {
        matches!(
            self,
            Self::READ6
                | Self::READ
                | Self::READ12
                | Self::READ16
                | Self::VERIFY
                | Self::VERIFY16
        )
    }
}

/// SERVICE ACTION IN(16) action selecting READ CAPACITY(16).
pub const SAI_READ_CAPACITY_16: u8 = 0x10;

/// READ/WRITE BUFFER mode bits in CDB byte 1.
pub const BUFFER_MODE_DATA: u8 = 0x02;
pub const BUFFER_MODE_ECHO: u8 = 0x0A;
pub const BUFFER_MODE_DESCRIPTOR: u8 = 0x01;

pub const SENSE_KEY_MEDIUM_ERROR: u8 = 0x03;

/// Additional sense code for "failure prediction threshold exceeded".
pub const ASC_FAILURE_PREDICTION: u8 = 0x5D;

/// Incorrect length indicator in byte 2 of fixed format sense data.
pub const SENSE_ILI: u8 = 0x20;

/// Sign bit of the fixed format sense information field (byte 3), set when
/// the reported residue is negative.
pub const SENSE_INFO_NEGATIVE: u8 = 0x80;

pub const PERIPHERAL_DIRECT_ACCESS: u8 = 0x00;

/// Maximum sense data length kept with a completed command.
pub const SENSE_BUFFER_SIZE: usize = 96;
