// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SCSI commands, targets and logical units as seen by the host.

use futures::channel::oneshot;
use mpi_spec::scsi::ScsiOp;
use mpi_spec::scsi::SENSE_BUFFER_SIZE;
use mpi_spec::ScsiStatus;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// The host byte of a command result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostStatus {
    Ok,
    /// Selection timed out; the device is not there.
    NoConnect,
    BusBusy,
    /// The bus or target id is invalid. Not retried.
    BadTarget,
    /// The command was terminated by a reset.
    Reset,
    Error,
    /// Retryable error.
    SoftError,
    /// Requeue without counting a retry.
    Requeue,
}

/// The result of a command: host byte and SCSI status byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScsiResult {
    pub host: HostStatus,
    pub status: ScsiStatus,
}

impl ScsiResult {
    pub const GOOD: Self = Self {
        host: HostStatus::Ok,
        status: ScsiStatus::SUCCESS,
    };

    pub const fn host(host: HostStatus) -> Self {
        Self {
            host,
            status: ScsiStatus::SUCCESS,
        }
    }

    pub const fn status(status: ScsiStatus) -> Self {
        Self {
            host: HostStatus::Ok,
            status,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataDirection {
    None,
    FromDevice,
    ToDevice,
}

/// A mapped scatter-gather entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SgEntry {
    pub address: u64,
    pub len: u32,
}

/// Static properties of a target, discovered at scan time.
#[derive(Clone, Debug, Default)]
pub struct TargetConfig {
    pub channel: u8,
    pub id: u8,
    /// The target is an integrated RAID volume.
    pub raid_volume: bool,
    /// The target is a physical disk hidden behind a RAID volume.
    pub raid_component: bool,
    /// The target accepts tagged commands.
    pub q_yes: bool,
    /// Negotiated SPI sync factor. Lower is faster.
    pub min_sync_factor: u8,
}

#[derive(Debug)]
pub struct ScsiTarget {
    pub channel: u8,
    pub id: u8,
    raid_volume: bool,
    raid_component: bool,
    q_yes: bool,
    min_sync_factor: u8,
    led_on: AtomicBool,
    deleted: AtomicBool,
    sel_timeouts: AtomicU16,
}

impl ScsiTarget {
    pub fn new(config: TargetConfig) -> Arc<Self> {
        Arc::new(Self {
            channel: config.channel,
            id: config.id,
            raid_volume: config.raid_volume,
            raid_component: config.raid_component,
            q_yes: config.q_yes,
            min_sync_factor: config.min_sync_factor,
            led_on: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            sel_timeouts: AtomicU16::new(0),
        })
    }

    pub fn is_raid_volume(&self) -> bool {
        self.raid_volume
    }

    pub fn is_raid_component(&self) -> bool {
        self.raid_component
    }

    pub fn q_yes(&self) -> bool {
        self.q_yes
    }

    pub fn min_sync_factor(&self) -> u8 {
        self.min_sync_factor
    }

    /// Whether the enclosure fault LED was lit for this target.
    pub fn led_on(&self) -> bool {
        self.led_on.load(Ordering::Relaxed)
    }

    pub(crate) fn set_led_on(&self, on: bool) {
        self.led_on.store(on, Ordering::Relaxed);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_deleted(&self) {
        self.deleted.store(true, Ordering::Relaxed);
    }

    /// Selection timeouts seen on this target. Saturates at `u16::MAX`.
    pub fn sel_timeouts(&self) -> u16 {
        self.sel_timeouts.load(Ordering::Relaxed)
    }

    pub(crate) fn count_sel_timeout(&self) {
        let _ = self
            .sel_timeouts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1));
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeviceConfig {
    pub lun: u64,
    /// Peripheral device type from INQUIRY.
    pub peripheral_type: u8,
    pub tagged_supported: bool,
    /// The upper layer finished configuring the device.
    pub configured: bool,
}

/// A logical unit.
#[derive(Debug)]
pub struct ScsiDevice {
    target: Arc<ScsiTarget>,
    lun: u64,
    peripheral_type: u8,
    tagged_supported: bool,
    configured: bool,
    queue_depth: AtomicU16,
    tagged: AtomicBool,
}

impl ScsiDevice {
    pub fn new(target: Arc<ScsiTarget>, config: DeviceConfig) -> Arc<Self> {
        Arc::new(Self {
            target,
            lun: config.lun,
            peripheral_type: config.peripheral_type,
            tagged_supported: config.tagged_supported,
            configured: config.configured,
            queue_depth: AtomicU16::new(1),
            tagged: AtomicBool::new(false),
        })
    }

    pub fn target(&self) -> &Arc<ScsiTarget> {
        &self.target
    }

    pub fn lun(&self) -> u64 {
        self.lun
    }

    pub fn peripheral_type(&self) -> u8 {
        self.peripheral_type
    }

    pub fn tagged_supported(&self) -> bool {
        self.tagged_supported
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn queue_depth(&self) -> u16 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Whether the upper layer sends tagged commands to this device.
    pub fn tagged(&self) -> bool {
        self.tagged.load(Ordering::Relaxed)
    }

    pub(crate) fn set_queue_depth(&self, depth: u16, tagged: bool) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.tagged.store(tagged, Ordering::Relaxed);
    }
}

/// What the OS receives when a command completes.
#[derive(Clone, Debug)]
pub struct ScsiCompletion {
    pub result: ScsiResult,
    pub resid: u32,
    sense: [u8; SENSE_BUFFER_SIZE],
    sense_len: usize,
}

impl ScsiCompletion {
    pub fn sense(&self) -> &[u8] {
        &self.sense[..self.sense_len]
    }
}

pub type CompletionReceiver = oneshot::Receiver<ScsiCompletion>;

struct CmdState {
    /// Request index of the frame carrying the command, while it is owned by
    /// the IOC.
    frame: Option<u16>,
    serial: u64,
    result: ScsiResult,
    resid: u32,
    sense: [u8; SENSE_BUFFER_SIZE],
    sense_len: usize,
    done: Option<oneshot::Sender<ScsiCompletion>>,
}

/// A command from the OS.
pub struct ScsiCmd {
    device: Arc<ScsiDevice>,
    cdb: [u8; 16],
    cdb_len: u8,
    direction: DataDirection,
    sg_list: Vec<SgEntry>,
    bufflen: u32,
    underflow: u32,
    state: Mutex<CmdState>,
}

impl std::fmt::Debug for ScsiCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScsiCmd")
            .field("channel", &self.device.target.channel)
            .field("id", &self.device.target.id)
            .field("lun", &self.device.lun)
            .field("op", &self.op())
            .field("bufflen", &self.bufflen)
            .finish()
    }
}

/// Error returned when a command cannot be built.
#[derive(Debug, Error)]
pub enum CmdError {
    #[error("cdb is {0} bytes, at most 16 are supported")]
    CdbTooLong(usize),
    #[error("scatter-gather list exceeds the 32-bit data length")]
    TransferTooLong,
}

impl ScsiCmd {
    /// Creates a command. `underflow` is the minimum transfer below which a
    /// short transfer is an error.
    pub fn new(
        device: Arc<ScsiDevice>,
        cdb: &[u8],
        direction: DataDirection,
        sg_list: Vec<SgEntry>,
        underflow: u32,
    ) -> Result<Arc<Self>, CmdError> {
        if cdb.len() > 16 {
            return Err(CmdError::CdbTooLong(cdb.len()));
        }
        let mut cdb_buf = [0; 16];
        cdb_buf[..cdb.len()].copy_from_slice(cdb);
        let bufflen = sg_list
            .iter()
            .try_fold(0u32, |total, sg| total.checked_add(sg.len))
            .ok_or(CmdError::TransferTooLong)?;
        Ok(Arc::new(Self {
            device,
            cdb: cdb_buf,
            cdb_len: cdb.len() as u8,
            direction,
            sg_list,
            bufflen,
            underflow,
            state: Mutex::new(CmdState {
                frame: None,
                serial: 0,
                result: ScsiResult::GOOD,
                resid: 0,
                sense: [0; SENSE_BUFFER_SIZE],
                sense_len: 0,
                done: None,
            }),
        }))
    }

    pub fn device(&self) -> &Arc<ScsiDevice> {
        &self.device
    }

    pub fn target(&self) -> &Arc<ScsiTarget> {
        &self.device.target
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }

    pub fn op(&self) -> ScsiOp {
        ScsiOp(self.cdb[0])
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    pub fn sg_list(&self) -> &[SgEntry] {
        &self.sg_list
    }

    /// Total bytes described by the scatter-gather list.
    pub fn bufflen(&self) -> u32 {
        self.bufflen
    }

    pub fn underflow(&self) -> u32 {
        self.underflow
    }

    /// Serial number of the latest submission.
    pub fn serial(&self) -> u64 {
        self.state.lock().serial
    }

    /// The request index of the frame carrying the command, if the IOC owns
    /// it.
    pub fn frame_index(&self) -> Option<u16> {
        self.state.lock().frame
    }

    pub fn result(&self) -> ScsiResult {
        self.state.lock().result
    }

    pub fn resid(&self) -> u32 {
        self.state.lock().resid
    }

    /// Arms the command for a new submission on frame `index`.
    pub(crate) fn begin(&self, index: u16, serial: u64) -> CompletionReceiver {
        let (send, recv) = oneshot::channel();
        let mut state = self.state.lock();
        state.frame = Some(index);
        state.serial = serial;
        state.result = ScsiResult::GOOD;
        state.resid = 0;
        state.sense_len = 0;
        state.done = Some(send);
        recv
    }

    pub(crate) fn clear_frame(&self) {
        self.state.lock().frame = None;
    }

    pub(crate) fn set_result(&self, result: ScsiResult) {
        self.state.lock().result = result;
    }

    pub(crate) fn set_resid(&self, resid: u32) {
        self.state.lock().resid = resid;
    }

    /// Stores sense data, truncated to the sense buffer size, and returns the
    /// stored bytes.
    pub(crate) fn set_sense(&self, sense: &[u8]) -> [u8; SENSE_BUFFER_SIZE] {
        let mut state = self.state.lock();
        let len = sense.len().min(SENSE_BUFFER_SIZE);
        state.sense[..len].copy_from_slice(&sense[..len]);
        state.sense[len..].fill(0);
        state.sense_len = len;
        state.sense
    }

    /// Rewrites byte `offset` of the stored sense data.
    pub(crate) fn patch_sense(&self, offset: usize, value: u8) {
        self.state.lock().sense[offset] = value;
    }

    pub fn sense(&self) -> Vec<u8> {
        let state = self.state.lock();
        state.sense[..state.sense_len].to_vec()
    }

    /// Hands the result to the OS. Never blocks.
    pub(crate) fn complete(&self) {
        let mut state = self.state.lock();
        let completion = ScsiCompletion {
            result: state.result,
            resid: state.resid,
            sense: state.sense,
            sense_len: state.sense_len,
        };
        if let Some(done) = state.done.take() {
            // The OS may have stopped waiting.
            let _ = done.send(completion);
        }
    }
}
