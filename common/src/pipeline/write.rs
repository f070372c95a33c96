use anyhow::Context;

use super::{Flow, Outcome, State, classify};
use crate::block::Block;
use crate::substrate::{Event, Substrate};

/// Hands the pending part of `block` to the substrate as a write to the destination.
pub(super) fn submit<S: Substrate>(
    state: &mut State<'_>,
    substrate: &mut S,
    block: Block,
) -> anyhow::Result<()> {
    let offset = block.offset();
    let len = block.remaining();
    substrate
        .submit_write(state.destination, block)
        .with_context(|| format!("failed submitting write of {len} bytes at offset {offset}"))?;
    state.summary.writes_submitted += 1;
    Ok(())
}

/// Only confirmed bytes count towards the copy: the remaining-bytes counter moves on short and
/// full completions, never on a retry.
fn confirm_written(state: &mut State<'_>, bytes_written: usize) {
    let bytes_written = bytes_written as u64;
    debug_assert!(bytes_written <= state.bytes_remaining);
    state.bytes_remaining -= bytes_written;
    state.summary.bytes_copied += bytes_written;
    state.prog_track.bytes_written.add(bytes_written);
}

pub(super) fn on_completion<S: Substrate>(
    state: &mut State<'_>,
    substrate: &mut S,
    event: Event,
) -> anyhow::Result<Flow> {
    let outcome = classify(&event)?;
    let mut block = event.block;
    match outcome {
        Outcome::TryAgain => {
            tracing::trace!("write at offset {} asked to try again", block.offset());
            state.summary.write_retries += 1;
            state.prog_track.retries.inc();
            submit(state, substrate, block)?;
            Ok(Flow::Continue)
        }
        Outcome::Short(bytes_written) => {
            block.advance(bytes_written);
            confirm_written(state, bytes_written);
            tracing::trace!(
                "short write of {} bytes, {} left at offset {}",
                bytes_written,
                block.remaining(),
                block.offset()
            );
            state.summary.short_writes += 1;
            state.prog_track.short_transfers.inc();
            submit(state, substrate, block)?;
            Ok(Flow::Continue)
        }
        Outcome::Full(bytes_written) => {
            block.advance(bytes_written);
            confirm_written(state, bytes_written);
            state.summary.blocks_copied += 1;
            state.prog_track.blocks.finish();
            if state.bytes_remaining == 0 {
                state.retire(block);
                return Ok(Flow::Finished);
            }
            match state.claim_next_range() {
                Some((offset, len)) => {
                    tracing::trace!(
                        "slot {} moves on to {} bytes at offset {}",
                        block.slot(),
                        len,
                        offset
                    );
                    block.assign(offset, len);
                    state.prog_track.blocks.start();
                    super::read::submit(state, substrate, block)?;
                }
                None => state.retire(block),
            }
            Ok(Flow::Continue)
        }
    }
}
