// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builds the scatter-gather list of a SCSI IO request, continuing it into
//! chain buffers when it does not fit in the request frame.

use crate::adapter::MessageFrame;
use crate::adapter::MptAdapter;
use crate::chain::ChainPool;
use crate::cmd::DataDirection;
use crate::cmd::SgEntry;
use crate::memory::MemoryBlock;
use mpi_spec::REQUEST_CHAIN_OFFSET;
use mpi_spec::SGE_FLAGS_END_OF_BUFFER;
use mpi_spec::SGE_FLAGS_END_OF_LIST;
use mpi_spec::SGE_FLAGS_HOST_TO_IOC;
use mpi_spec::SGE_FLAGS_IOC_TO_HOST;
use mpi_spec::SGE_FLAGS_LAST_ELEMENT;
use mpi_spec::SGE_FLAGS_SIMPLE_ELEMENT;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SglError {
    #[error("no chain buffer available")]
    NoChainBuffer,
    #[error("empty scatter-gather list")]
    Empty,
}

/// A chain element whose length is only known once the buffer it points to
/// has been filled.
struct PendingChain {
    buf: MemoryBlock,
    offset: usize,
}

/// Writes `entries` into `frame` starting at byte `sgl_offset`.
///
/// Returns the frame's RequestNB. On failure, chain buffers already taken are
/// linked to the frame's request index; the caller releases them with
/// [`ChainPool::release`].
pub fn build_sgl<A: MptAdapter + ?Sized>(
    adapter: &A,
    pool: &ChainPool,
    frame: &MessageFrame,
    sgl_offset: usize,
    entries: &[SgEntry],
    direction: DataDirection,
) -> Result<u8, SglError> {
    if entries.is_empty() {
        return Err(SglError::Empty);
    }

    let facts = adapter.facts();
    let frame_size = facts.req_sz;
    let sge_size = adapter.sge_size();
    let req_idx = frame.index();
    let sgdir = if direction == DataDirection::ToDevice {
        SGE_FLAGS_HOST_TO_IOC
    } else {
        SGE_FLAGS_IOC_TO_HOST
    };
    let request_nb =
        |sge_offset: usize| ((((sge_offset - 1) >> facts.nb_shift_factor) + 1) & 3) as u8;

    let mut buf = frame.mem().clone();
    let mut sge_offset = sgl_offset;
    let mut sges_left = entries.len();
    let mut next = 0;
    let mut chain_sge: Option<PendingChain> = None;
    let mut chain_idx = None;
    let mut nb = 0;

    loop {
        let slots = frame_size.saturating_sub(sge_offset) / sge_size;
        let this_frame = sges_left.min(slots);
        let flags = SGE_FLAGS_SIMPLE_ELEMENT | sgdir;
        let mut sg_done = 0;
        let mut last_written = None;

        // All but the last element that fits. Zero-length entries are
        // consumed without using a slot.
        for _ in 0..this_frame.saturating_sub(1) {
            let sg = entries[next];
            next += 1;
            sg_done += 1;
            if sg.len == 0 {
                continue;
            }
            buf.write_at(
                sge_offset,
                adapter.add_sge(flags | sg.len, sg.address).as_bytes(),
            );
            last_written = Some(sge_offset);
            sge_offset += sge_size;
        }

        if this_frame == sges_left {
            // The rest of the list fits. The final element may have a length
            // of zero.
            let sg = entries[next];
            let flags =
                flags | SGE_FLAGS_LAST_ELEMENT | SGE_FLAGS_END_OF_BUFFER | SGE_FLAGS_END_OF_LIST;
            buf.write_at(
                sge_offset,
                adapter.add_sge(flags | sg.len, sg.address).as_bytes(),
            );
            sge_offset += sge_size;

            match (chain_sge, chain_idx) {
                (Some(pending), Some(chain)) => {
                    pending.buf.write_at(
                        pending.offset,
                        adapter
                            .add_chain(0, sge_offset as u16, pool.buffer(chain).iova())
                            .as_bytes(),
                    );
                }
                _ => {
                    frame.mem().write_at(REQUEST_CHAIN_OFFSET, &[0]);
                    nb = request_nb(sge_offset);
                    tracing::trace!(req_idx, nb, sge_offset, "single buffer sgl");
                }
            }
            return Ok(nb);
        }

        // A chain buffer is needed. The last simple element in this buffer
        // gets the last element flag and the chain element follows it.
        if let Some(offset) = last_written {
            let flags_length = buf.read_u32(offset);
            buf.write_u32(offset, flags_length | SGE_FLAGS_LAST_ELEMENT);
        }

        let chain_pos = sge_offset;
        match (&chain_sge, chain_idx) {
            (Some(pending), Some(chain)) => {
                let next_chain = (sge_offset >> 2) as u8;
                sge_offset += sge_size;
                pending.buf.write_at(
                    pending.offset,
                    adapter
                        .add_chain(next_chain, sge_offset as u16, pool.buffer(chain).iova())
                        .as_bytes(),
                );
            }
            _ => {
                frame
                    .mem()
                    .write_at(REQUEST_CHAIN_OFFSET, &[(sge_offset >> 2) as u8]);
                nb = request_nb(sge_offset);
                tracing::trace!(req_idx, nb, sge_offset, "chain buffer needed");
            }
        }

        sges_left -= sg_done;

        let Some(new_chain) = pool.acquire_linked(req_idx, chain_idx) else {
            tracing::debug!(req_idx, "out of chain buffers building sgl");
            return Err(SglError::NoChainBuffer);
        };

        chain_sge = Some(PendingChain {
            buf,
            offset: chain_pos,
        });
        chain_idx = Some(new_chain);
        buf = pool.buffer(new_chain);
        sge_offset = 0;
    }
}
