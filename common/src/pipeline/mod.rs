//! Bounded-concurrency block copy
//!
//! The pipeline keeps up to `max_concurrent_blocks` blocks in flight. Each block is read from the
//! source, then written to the destination; when its write completes the same slot (and buffer)
//! picks up the next unread range of the source. Nothing else starts new work, so the number of
//! outstanding blocks never exceeds what was primed at the start.
//!
//! All state transitions happen while dispatching one completion at a time, on the task that
//! waits for completions, so the pipeline state needs no synchronization.
//!
//! # Error Handling
//!
//! Short transfers and "try again" results are retried indefinitely. Any other failure stops the
//! pipeline immediately and is returned as an [`Error`] carrying the [`Summary`] of what was done
//! so far. The typed cause can be recovered with `error.source.downcast_ref::<Failure>()`.

mod read;
mod write;

use anyhow::Context;
use tracing::instrument;

use crate::block::{Block, Phase};
use crate::progress;
use crate::substrate::{Event, EventKind, Handle, Route, Substrate, TRY_AGAIN};

/// Error type for copy operations that preserves the summary even on failure.
///
/// # Logging Convention
/// The Display implementation shows the full error chain:
/// ```ignore
/// tracing::error!("copy failed: {}", &error);
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("cannot determine how many bytes to copy from {path:?}: {reason}")]
    SizeProbe {
        path: std::path::PathBuf,
        reason: String,
    },
    #[error("{route} at offset {offset} failed: {source}")]
    Io {
        route: Route,
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("{route} at offset {offset} failed: I/O substrate reported an error")]
    Substrate { route: Route, offset: u64 },
    #[error("{route} at offset {offset} reported {reported} bytes for a {requested} byte request")]
    Overrun {
        route: Route,
        offset: u64,
        requested: usize,
        reported: i64,
    },
    #[error("{route} completion delivered for a block in {phase:?} phase")]
    Misrouted { route: Route, phase: Phase },
    #[error("completion stream ended with {remaining} bytes left to write")]
    Incomplete { remaining: u64 },
}

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    pub max_concurrent_blocks: usize,
    pub block_size: usize,
    pub overwrite: bool,
}

/// 64 blocks of 128KiB, replacing an existing destination.
impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_blocks: 64,
            block_size: 128 * 1024,
            overwrite: true,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), Failure> {
        if self.max_concurrent_blocks == 0 {
            return Err(Failure::Configuration(
                "max concurrent blocks must be greater than 0".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(Failure::Configuration(
                "block size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_copied: u64,
    pub blocks_copied: u64,
    pub reads_submitted: u64,
    pub writes_submitted: u64,
    pub short_reads: u64,
    pub short_writes: u64,
    pub read_retries: u64,
    pub write_retries: u64,
    pub peak_blocks_in_flight: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            blocks_copied: self.blocks_copied + other.blocks_copied,
            reads_submitted: self.reads_submitted + other.reads_submitted,
            writes_submitted: self.writes_submitted + other.writes_submitted,
            short_reads: self.short_reads + other.short_reads,
            short_writes: self.short_writes + other.short_writes,
            read_retries: self.read_retries + other.read_retries,
            write_retries: self.write_retries + other.write_retries,
            peak_blocks_in_flight: std::cmp::max(
                self.peak_blocks_in_flight,
                other.peak_blocks_in_flight,
            ),
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            blocks copied: {}\n\
            reads submitted: {}\n\
            writes submitted: {}\n\
            short reads: {}\n\
            short writes: {}\n\
            read retries: {}\n\
            write retries: {}\n\
            peak blocks in flight: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.blocks_copied,
            self.reads_submitted,
            self.writes_submitted,
            self.short_reads,
            self.short_writes,
            self.read_retries,
            self.write_retries,
            self.peak_blocks_in_flight,
        )
    }
}

/// Whether the pipeline should keep waiting for completions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

/// Pipeline-wide bookkeeping, written only from [`dispatch`] and [`prime`].
struct State<'a> {
    file_size: u64,
    block_size: usize,
    next_read_offset: u64,
    bytes_remaining: u64,
    blocks_in_flight: usize,
    source: Handle,
    destination: Handle,
    summary: Summary,
    prog_track: &'a progress::Progress,
}

impl<'a> State<'a> {
    fn new(
        prog_track: &'a progress::Progress,
        source: Handle,
        destination: Handle,
        file_size: u64,
        block_size: usize,
    ) -> Self {
        Self {
            file_size,
            block_size,
            next_read_offset: 0,
            bytes_remaining: file_size,
            blocks_in_flight: 0,
            source,
            destination,
            summary: Summary::default(),
            prog_track,
        }
    }

    /// Takes the next unread range of the source, if any is left.
    fn claim_next_range(&mut self) -> Option<(u64, usize)> {
        if self.next_read_offset >= self.file_size {
            return None;
        }
        let left = self.file_size - self.next_read_offset;
        let len = usize::try_from(left).map_or(self.block_size, |left| left.min(self.block_size));
        let offset = self.next_read_offset;
        self.next_read_offset += len as u64;
        debug_assert!(self.next_read_offset <= self.file_size);
        Some((offset, len))
    }

    fn retire(&mut self, mut block: Block) {
        tracing::trace!("retiring slot {}", block.slot());
        block.retire();
        self.blocks_in_flight -= 1;
    }
}

/// What a completion means for the block it belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Outcome {
    TryAgain,
    Short(usize),
    Full(usize),
}

fn classify(event: &Event) -> Result<Outcome, Failure> {
    let route = event.route;
    let offset = event.block.offset();
    let requested = event.block.remaining();
    if event.kind == EventKind::Error {
        return Err(Failure::Substrate { route, offset });
    }
    if event.result == TRY_AGAIN {
        return Ok(Outcome::TryAgain);
    }
    if event.result < 0 {
        let errno = i32::try_from(-event.result).unwrap_or(libc::EIO);
        return Err(Failure::Io {
            route,
            offset,
            source: std::io::Error::from_raw_os_error(errno),
        });
    }
    let transferred = match usize::try_from(event.result) {
        Ok(transferred) if transferred <= requested => transferred,
        _ => {
            return Err(Failure::Overrun {
                route,
                offset,
                requested,
                reported: event.result,
            });
        }
    };
    if transferred == 0 && requested > 0 {
        // a zero-length completion would be retried forever
        let source = match route {
            Route::Read => std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "source ended before its probed size",
            ),
            Route::Write => std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "destination accepted no bytes",
            ),
        };
        return Err(Failure::Io {
            route,
            offset,
            source,
        });
    }
    if transferred < requested {
        Ok(Outcome::Short(transferred))
    } else {
        Ok(Outcome::Full(transferred))
    }
}

/// Starts the initial reads: one per slot, up to the number of blocks the file needs. Slot
/// buffers are sized to the smaller of the block size and the file size.
fn prime<S: Substrate>(
    state: &mut State<'_>,
    substrate: &mut S,
    max_concurrent_blocks: usize,
) -> anyhow::Result<()> {
    // no range is ever longer than the file
    let capacity = usize::try_from(state.file_size)
        .map_or(state.block_size, |file_size| file_size.min(state.block_size));
    for slot in 0..max_concurrent_blocks {
        let Some((offset, len)) = state.claim_next_range() else {
            break;
        };
        let mut block = Block::new(slot, capacity);
        block.assign(offset, len);
        state.blocks_in_flight += 1;
        state.summary.peak_blocks_in_flight = std::cmp::max(
            state.summary.peak_blocks_in_flight,
            state.blocks_in_flight,
        );
        state.prog_track.blocks.start();
        read::submit(state, substrate, block)?;
    }
    tracing::debug!("primed {} blocks", state.blocks_in_flight);
    Ok(())
}

fn dispatch<S: Substrate>(
    state: &mut State<'_>,
    substrate: &mut S,
    event: Event,
) -> anyhow::Result<Flow> {
    tracing::trace!(
        "{} completion: result {}, block {:?}",
        event.route,
        event.result,
        &event.block
    );
    match (event.route, event.block.phase()) {
        (Route::Read, Phase::Reading) => read::on_completion(state, substrate, event),
        (Route::Write, Phase::Writing) => write::on_completion(state, substrate, event),
        (route, phase) => Err(Failure::Misrouted { route, phase }.into()),
    }
}

/// Copies `file_size` bytes from `source` to `destination`, both already opened on `substrate`
/// with their completion handlers registered.
#[instrument(skip(prog_track, substrate))]
pub async fn transfer<S: Substrate>(
    prog_track: &progress::Progress,
    substrate: &mut S,
    source: Handle,
    destination: Handle,
    file_size: u64,
    settings: &Settings,
) -> Result<Summary, Error> {
    settings
        .validate()
        .map_err(|err| Error::new(err.into(), Default::default()))?;
    prog_track.total_bytes.add(file_size);
    let mut state = State::new(
        prog_track,
        source,
        destination,
        file_size,
        settings.block_size,
    );
    if let Err(err) = prime(&mut state, substrate, settings.max_concurrent_blocks) {
        return Err(Error::new(err, state.summary));
    }
    while state.bytes_remaining > 0 {
        let Some(event) = substrate.wait_for_next_event().await else {
            let remaining = state.bytes_remaining;
            return Err(Error::new(
                Failure::Incomplete { remaining }.into(),
                state.summary,
            ));
        };
        match dispatch(&mut state, substrate, event) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Finished) => break,
            Err(err) => return Err(Error::new(err, state.summary)),
        }
    }
    debug_assert_eq!(state.bytes_remaining, 0);
    tracing::debug!("all {} bytes written", file_size);
    Ok(state.summary)
}

/// Copies the full contents of `src` into `dst` through `substrate`.
///
/// The source may be a regular file or a block device. Handles are closed on both success and
/// failure; a failure to close the destination after a successful transfer is reported.
#[instrument(skip(prog_track, substrate))]
pub async fn copy<S: Substrate>(
    prog_track: &progress::Progress,
    substrate: &mut S,
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &Settings,
) -> Result<Summary, Error> {
    settings
        .validate()
        .map_err(|err| Error::new(err.into(), Default::default()))?;
    tracing::debug!("opening {:?} for reading and {:?} for writing", src, dst);
    let source = substrate
        .open_for_read(src)
        .map_err(|err| Error::new(err, Default::default()))?;
    let destination = match substrate.create_for_write(dst, settings.overwrite) {
        Ok(destination) => destination,
        Err(err) => {
            close_quietly(substrate, source);
            return Err(Error::new(err, Default::default()));
        }
    };
    let result = copy_opened(prog_track, substrate, src, source, destination, settings).await;
    match result {
        Ok(summary) => {
            let closed_dst = substrate
                .close(destination)
                .with_context(|| format!("failed closing {:?}", &dst));
            close_quietly(substrate, source);
            closed_dst.map_err(|err| Error::new(err, summary))?;
            Ok(summary)
        }
        Err(err) => {
            close_quietly(substrate, destination);
            close_quietly(substrate, source);
            Err(err)
        }
    }
}

async fn copy_opened<S: Substrate>(
    prog_track: &progress::Progress,
    substrate: &mut S,
    src: &std::path::Path,
    source: Handle,
    destination: Handle,
    settings: &Settings,
) -> Result<Summary, Error> {
    substrate
        .register_completion_handler(source, Route::Read)
        .and_then(|()| substrate.register_completion_handler(destination, Route::Write))
        .map_err(|err| Error::new(err, Default::default()))?;
    let file_size = substrate.probe_size(source).map_err(|err| {
        let failure = Failure::SizeProbe {
            path: src.to_owned(),
            reason: format!("{err:#}"),
        };
        Error::new(failure.into(), Default::default())
    })?;
    tracing::debug!("copying {} bytes", file_size);
    transfer(
        prog_track,
        substrate,
        source,
        destination,
        file_size,
        settings,
    )
    .await
}

fn close_quietly<S: Substrate>(substrate: &mut S, handle: Handle) {
    if let Err(error) = substrate.close(handle) {
        tracing::debug!("failed closing {:?}: {:#}", handle, error);
    }
}
