use anyhow::Context;

use super::{Flow, Outcome, State, classify};
use crate::block::Block;
use crate::substrate::{Event, Substrate};

/// Hands the pending part of `block` to the substrate as a read from the source.
pub(super) fn submit<S: Substrate>(
    state: &mut State<'_>,
    substrate: &mut S,
    block: Block,
) -> anyhow::Result<()> {
    let offset = block.offset();
    let len = block.remaining();
    substrate
        .submit_read(state.source, block)
        .with_context(|| format!("failed submitting read of {len} bytes at offset {offset}"))?;
    state.summary.reads_submitted += 1;
    Ok(())
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
            tracing::trace!("read at offset {} asked to try again", block.offset());
            state.summary.read_retries += 1;
            state.prog_track.retries.inc();
            submit(state, substrate, block)?;
        }
        Outcome::Short(bytes_read) => {
            block.advance(bytes_read);
            tracing::trace!(
                "short read of {} bytes, {} left at offset {}",
                bytes_read,
                block.remaining(),
                block.offset()
            );
            state.summary.short_reads += 1;
            state.prog_track.short_transfers.inc();
            state.prog_track.bytes_read.add(bytes_read as u64);
            submit(state, substrate, block)?;
        }
        Outcome::Full(bytes_read) => {
            block.advance(bytes_read);
            state.prog_track.bytes_read.add(bytes_read as u64);
            block.begin_write();
            super::write::submit(state, substrate, block)?;
        }
    }
    Ok(Flow::Continue)
}
