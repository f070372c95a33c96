//! In-memory substrate with scripted faults, used by the pipeline tests.

use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, bail};

use crate::block::Block;
use crate::substrate::{Event, EventKind, Handle, Route, Substrate, TRY_AGAIN};

const SOURCE: Handle = Handle::new(0);
const DESTINATION: Handle = Handle::new(1);

/// What happens to one submitted operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Transfer only this many bytes; ignored unless strictly between 0 and the request length.
    Short(usize),
    TryAgain,
    Errno(i32),
    ErrorEvent,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Submitted {
        slot: usize,
        op: Route,
        offset: u64,
        len: usize,
    },
    Completed {
        slot: usize,
        op: Route,
        offset: u64,
        len: usize,
        result: i64,
    },
}

struct Pending {
    handle: Handle,
    op: Route,
    block: Block,
    fault: Option<Fault>,
}

#[derive(Default)]
pub struct ScriptedSubstrate {
    pub source: Vec<u8>,
    pub destination: Vec<u8>,
    /// Size reported by `probe_size`, defaults to the source length.
    pub probed_size: Option<u64>,
    pub probe_error: bool,
    /// Faults applied to the next submission matching (op, offset).
    targeted: HashMap<(Route, u64), VecDeque<Fault>>,
    /// Faults applied to submissions in order, after targeted ones.
    plan: VecDeque<Option<Fault>>,
    /// Picks which pending operation completes next: `choice % pending.len()`.
    delivery: VecDeque<usize>,
    /// Stop delivering events after this many.
    pub events_before_hangup: Option<usize>,
    /// Fail the submission with this index (0-based).
    pub failing_submission: Option<usize>,
    /// Closing the destination reports an error after releasing it.
    pub fail_destination_close: bool,
    routes: HashMap<Handle, Route>,
    open: Vec<Handle>,
    opened: usize,
    pending: Vec<Pending>,
    submissions: usize,
    delivered: usize,
    peak_pending: usize,
    log: Vec<LogEntry>,
}

impl ScriptedSubstrate {
    pub fn new(source: Vec<u8>) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn fault_at(&mut self, op: Route, offset: u64, fault: Fault) -> &mut Self {
        self.targeted.entry((op, offset)).or_default().push_back(fault);
        self
    }

    pub fn with_plan(&mut self, plan: Vec<Option<Fault>>) -> &mut Self {
        self.plan = plan.into();
        self
    }

    pub fn with_delivery(&mut self, delivery: Vec<usize>) -> &mut Self {
        self.delivery = delivery.into();
        self
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn submitted(&self) -> Vec<(Route, u64, usize)> {
        self.log
            .iter()
            .filter_map(|entry| match *entry {
                LogEntry::Submitted {
                    op, offset, len, ..
                } => Some((op, offset, len)),
                LogEntry::Completed { .. } => None,
            })
            .collect()
    }

    /// Highest number of operations outstanding at once.
    pub fn peak_pending(&self) -> usize {
        self.peak_pending
    }

    pub fn opened(&self) -> usize {
        self.opened
    }

    pub fn all_closed(&self) -> bool {
        self.open.is_empty()
    }

    fn submit(&mut self, handle: Handle, op: Route, block: Block) -> anyhow::Result<()> {
        if !self.routes.contains_key(&handle) {
            bail!("no completion handler registered for {:?}", handle);
        }
        if self.failing_submission == Some(self.submissions) {
            bail!("submission queue rejected request");
        }
        self.submissions += 1;
        self.log.push(LogEntry::Submitted {
            slot: block.slot(),
            op,
            offset: block.offset(),
            len: block.remaining(),
        });
        let fault = self
            .targeted
            .get_mut(&(op, block.offset()))
            .and_then(VecDeque::pop_front)
            .or_else(|| self.plan.pop_front().flatten());
        self.pending.push(Pending {
            handle,
            op,
            block,
            fault,
        });
        self.peak_pending = std::cmp::max(self.peak_pending, self.pending.len());
        Ok(())
    }

    fn execute(&mut self, pending: Pending) -> Event {
        let Pending {
            handle,
            op,
            mut block,
            fault,
        } = pending;
        let requested = block.remaining();
        let offset = block.offset();
        let (kind, result) = match fault {
            Some(Fault::TryAgain) => (EventKind::Normal, TRY_AGAIN),
            Some(Fault::Errno(errno)) => (EventKind::Normal, -i64::from(errno)),
            Some(Fault::ErrorEvent) => (EventKind::Error, 0),
            Some(Fault::Short(bytes)) if bytes > 0 && bytes < requested => {
                (EventKind::Normal, self.move_bytes(op, &mut block, bytes))
            }
            Some(Fault::Short(_)) | None => {
                (EventKind::Normal, self.move_bytes(op, &mut block, requested))
            }
        };
        self.log.push(LogEntry::Completed {
            slot: block.slot(),
            op,
            offset,
            len: requested,
            result,
        });
        let route = self.routes[&handle];
        Event {
            kind,
            route,
            result,
            block,
        }
    }

    fn move_bytes(&mut self, op: Route, block: &mut Block, bytes: usize) -> i64 {
        let start = usize::try_from(block.offset()).unwrap();
        match op {
            Route::Read => {
                let end = std::cmp::min(start + bytes, self.source.len());
                let start = std::cmp::min(start, end);
                let available = &self.source[start..end];
                block.pending_mut()[..available.len()].copy_from_slice(available);
                available.len() as i64
            }
            Route::Write => {
                if self.destination.len() < start + bytes {
                    self.destination.resize(start + bytes, 0);
                }
                self.destination[start..start + bytes].copy_from_slice(&block.pending()[..bytes]);
                bytes as i64
            }
        }
    }
}

impl Substrate for ScriptedSubstrate {
    fn open_for_read(&mut self, _path: &std::path::Path) -> anyhow::Result<Handle> {
        self.opened += 1;
        self.open.push(SOURCE);
        Ok(SOURCE)
    }

    fn create_for_write(
        &mut self,
        _path: &std::path::Path,
        _overwrite: bool,
    ) -> anyhow::Result<Handle> {
        self.opened += 1;
        self.open.push(DESTINATION);
        self.destination.clear();
        Ok(DESTINATION)
    }

    fn register_completion_handler(&mut self, handle: Handle, route: Route) -> anyhow::Result<()> {
        self.routes.insert(handle, route);
        Ok(())
    }

    fn probe_size(&mut self, _handle: Handle) -> anyhow::Result<u64> {
        if self.probe_error {
            return Err(anyhow!("unsupported file type"));
        }
        Ok(self.probed_size.unwrap_or(self.source.len() as u64))
    }

    fn submit_read(&mut self, handle: Handle, block: Block) -> anyhow::Result<()> {
        self.submit(handle, Route::Read, block)
    }

    fn submit_write(&mut self, handle: Handle, block: Block) -> anyhow::Result<()> {
        self.submit(handle, Route::Write, block)
    }

    async fn wait_for_next_event(&mut self) -> Option<Event> {
        if self.pending.is_empty() || self.events_before_hangup == Some(self.delivered) {
            return None;
        }
        let choice = self.delivery.pop_front().unwrap_or(0) % self.pending.len();
        let pending = self.pending.remove(choice);
        self.delivered += 1;
        Some(self.execute(pending))
    }

    fn close(&mut self, handle: Handle) -> anyhow::Result<()> {
        let index = self
            .open
            .iter()
            .position(|open| *open == handle)
            .ok_or_else(|| anyhow!("invalid handle {:?}", handle))?;
        self.open.remove(index);
        if handle == DESTINATION && self.fail_destination_close {
            bail!("flushing destination failed");
        }
        Ok(())
    }
}
