use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{Level, event, instrument};

/// Counter sharded per thread so that frequent updates never contend.
#[derive(Debug)]
pub struct TlsCounter {
    count: thread_local::ThreadLocal<AtomicU64>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        // only the owning thread writes its shard
        self.count
            .get_or(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count
            .iter()
            .map(|shard| shard.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks items that were started and finished, e.g. blocks in flight.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.started.inc();
    }

    pub fn finish(&self) {
        self.finished.inc();
    }

    #[instrument]
    pub fn get(&self) -> Status {
        // read finished first so a concurrent start/finish pair cannot make it overtake started
        let finished = self.finished.get();
        let mut status = Status {
            started: self.started.get(),
            finished,
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

pub struct Progress {
    pub blocks: ProgressCounter,
    pub total_bytes: TlsCounter,
    pub bytes_read: TlsCounter,
    pub bytes_written: TlsCounter,
    pub retries: TlsCounter,
    pub short_transfers: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            blocks: Default::default(),
            total_bytes: Default::default(),
            bytes_read: Default::default(),
            bytes_written: Default::default(),
            retries: Default::default(),
            short_transfers: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_written: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_written: progress.bytes_written.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let blocks = self.progress.blocks.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let written = self.progress.bytes_written.get();
        let total = self.progress.total_bytes.get();
        let average_rate = written as f64 / total_duration_secs;
        let current_rate = (written - self.last_written) as f64 / curr_duration_secs;
        let percent = if total == 0 {
            100.0
        } else {
            written as f64 * 100.0 / total as f64
        };
        self.last_written = written;
        self.last_update = time_now;
        format!(
            "-----------------------\n\
            BLOCKS:\n\
            in flight: {:>10}\n\
            done:      {:>10}\n\
            -----------------------\n\
            COPIED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            read:    {:>10}\n\
            written: {:>10} of {} ({:.1}%)\n\
            -----------------------\n\
            RETRIED:\n\
            try again: {:>10}\n\
            short:     {:>10}",
            blocks.started - blocks.finished,
            blocks.finished,
            bytesize::ByteSize(average_rate as u64),
            bytesize::ByteSize(current_rate as u64),
            bytesize::ByteSize(self.progress.bytes_read.get()),
            bytesize::ByteSize(written),
            bytesize::ByteSize(total),
            percent,
            self.progress.retries.get(),
            self.progress.short_transfers.get(),
        )
    }
}
