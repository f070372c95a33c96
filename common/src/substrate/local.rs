use std::os::unix::fs::FileExt;
use std::sync::Arc;

use anyhow::{Context, anyhow};

use super::{Event, EventKind, Handle, Route, Substrate, TRY_AGAIN};
use crate::block::Block;

struct Resource {
    file: Arc<std::fs::File>,
    path: std::path::PathBuf,
    route: Option<Route>,
}

/// Substrate backed by positional reads and writes on tokio's blocking thread pool.
///
/// Every submission becomes a task that first waits for throttle tokens and then performs a
/// single `read_at`/`write_at` call. That call may move fewer bytes than requested; the result is
/// reported as-is. Completions are delivered through an unbounded channel in the order the
/// operations finish.
///
/// A task that dies without producing an event sends `None` instead. Its block is lost, so the
/// event stream ends there and the caller sees an incomplete copy rather than waiting forever.
pub struct LocalSubstrate {
    resources: Vec<Option<Resource>>,
    runtime: tokio::runtime::Handle,
    sender: tokio::sync::mpsc::UnboundedSender<Option<Event>>,
    receiver: tokio::sync::mpsc::UnboundedReceiver<Option<Event>>,
    in_flight: usize,
    hung_up: bool,
    chunk_size: u64,
}

impl LocalSubstrate {
    /// Must be called from within a tokio runtime. `chunk_size` is used to charge I/O
    /// throttle tokens per submission (0 disables that accounting).
    pub fn new(chunk_size: u64) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("the local I/O substrate requires a running tokio runtime")?;
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        Ok(Self {
            resources: Vec::new(),
            runtime,
            sender,
            receiver,
            in_flight: 0,
            hung_up: false,
            chunk_size,
        })
    }

    fn insert(&mut self, file: std::fs::File, path: &std::path::Path) -> Handle {
        let resource = Resource {
            file: Arc::new(file),
            path: path.to_owned(),
            route: None,
        };
        if let Some(index) = self.resources.iter().position(Option::is_none) {
            self.resources[index] = Some(resource);
            Handle::new(index)
        } else {
            self.resources.push(Some(resource));
            Handle::new(self.resources.len() - 1)
        }
    }

    fn resource(&self, handle: Handle) -> anyhow::Result<&Resource> {
        self.resources
            .get(handle.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("invalid handle {:?}", handle))
    }

    fn submit(&mut self, handle: Handle, op: Route, mut block: Block) -> anyhow::Result<()> {
        let resource = self.resource(handle)?;
        let route = resource.route.with_context(|| {
            format!(
                "no completion handler registered for {:?}",
                &resource.path
            )
        })?;
        let file = resource.file.clone();
        let sender = self.sender.clone();
        let chunk_size = self.chunk_size;
        self.runtime.spawn(async move {
            throttle::get_ops_token().await;
            throttle::get_transfer_iops_tokens(chunk_size, block.remaining() as u64).await;
            let completed = tokio::task::spawn_blocking(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    transfer(&file, op, &mut block)
                }));
                match outcome {
                    Ok(result) => Event {
                        kind: EventKind::Normal,
                        route,
                        result,
                        block,
                    },
                    Err(_) => Event {
                        kind: EventKind::Error,
                        route,
                        result: 0,
                        block,
                    },
                }
            })
            .await;
            // the receiver is gone once the pipeline gave up, nobody to tell
            let _ = match completed {
                Ok(event) => sender.send(Some(event)),
                Err(error) => {
                    tracing::error!("{} task did not complete: {}", op, error);
                    sender.send(None)
                }
            };
        });
        self.in_flight += 1;
        Ok(())
    }
}

fn transfer(file: &std::fs::File, op: Route, block: &mut Block) -> i64 {
    let offset = block.offset();
    let result = match op {
        Route::Read => file.read_at(block.pending_mut(), offset),
        Route::Write => file.write_at(block.pending(), offset),
    };
    encode_result(result)
}

fn encode_result(result: std::io::Result<usize>) -> i64 {
    match result {
        Ok(bytes) => i64::try_from(bytes).unwrap_or(i64::MAX),
        Err(error)
            if matches!(
                error.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ) =>
        {
            TRY_AGAIN
        }
        Err(error) => -i64::from(error.raw_os_error().unwrap_or(libc::EIO)),
    }
}

impl Substrate for LocalSubstrate {
    fn open_for_read(&mut self, path: &std::path::Path) -> anyhow::Result<Handle> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open {:?} for reading", &path))?;
        Ok(self.insert(file, path))
    }

    fn create_for_write(
        &mut self,
        path: &std::path::Path,
        overwrite: bool,
    ) -> anyhow::Result<Handle> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path).map_err(|error| {
            if !overwrite && error.kind() == std::io::ErrorKind::AlreadyExists {
                anyhow!(
                    "destination {:?} already exists and overwriting was not requested",
                    path
                )
            } else {
                anyhow::Error::new(error).context(format!("cannot create {:?}", &path))
            }
        })?;
        Ok(self.insert(file, path))
    }

    fn register_completion_handler(&mut self, handle: Handle, route: Route) -> anyhow::Result<()> {
        let resource = self
            .resources
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| anyhow!("invalid handle {:?}", handle))?;
        resource.route = Some(route);
        Ok(())
    }

    fn probe_size(&mut self, handle: Handle) -> anyhow::Result<u64> {
        let resource = self.resource(handle)?;
        crate::probe::transfer_size(&resource.file)
            .with_context(|| format!("failed probing size of {:?}", &resource.path))
    }

    fn submit_read(&mut self, handle: Handle, block: Block) -> anyhow::Result<()> {
        self.submit(handle, Route::Read, block)
    }

    fn submit_write(&mut self, handle: Handle, block: Block) -> anyhow::Result<()> {
        self.submit(handle, Route::Write, block)
    }

    async fn wait_for_next_event(&mut self) -> Option<Event> {
        if self.hung_up || self.in_flight == 0 {
            return None;
        }
        let completion = self.receiver.recv().await?;
        self.in_flight -= 1;
        if completion.is_none() {
            tracing::error!(
                "lost a completion, ending the event stream with {} operations outstanding",
                self.in_flight
            );
            self.hung_up = true;
        }
        completion
    }

    fn close(&mut self, handle: Handle) -> anyhow::Result<()> {
        let resource = self
            .resources
            .get_mut(handle.index())
            .and_then(Option::take)
            .ok_or_else(|| anyhow!("invalid handle {:?}", handle))?;
        tracing::debug!("closing {:?}", &resource.path);
        if resource.route == Some(Route::Write) {
            resource
                .file
                .sync_all()
                .with_context(|| format!("failed flushing {:?}", &resource.path))?;
        }
        Ok(())
    }
}
