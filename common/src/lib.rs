//! Common library for the `ringcp` block copy tool
//!
//! This crate provides the copy pipeline and the pieces around it:
//!
//! - [`pipeline`] drives a fixed number of in-flight blocks through read and write stages
//! - [`substrate`] defines the asynchronous I/O interface the pipeline submits to, and
//!   [`substrate::LocalSubstrate`], the production implementation on top of the tokio runtime
//! - [`block`] holds the per-block state and buffer
//! - [`progress`] tracks global counters shown while a copy runs
//! - [`config`] and [`run`] build the runtime, logging, throttling and progress display for the
//!   command line tool
//!
//! # Copy Semantics
//!
//! The source may be a regular file or a block device; its size is probed once when the copy
//! starts. Blocks may complete in any order, each block's bytes land at the same offset in the
//! destination. Short reads and writes re-issue only the untransferred remainder, "try again"
//! results re-issue the identical request. Any other error aborts the copy and is returned
//! together with the [`pipeline::Summary`] of the work done up to that point.
//!
//! # Logging
//!
//! All modules log through `tracing`. The runner installs a `tracing-subscriber` registry whose
//! level follows `-v` (INFO / DEBUG / TRACE, default ERROR) unless `RUST_LOG` is set.
//!
//! # Examples
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), common::pipeline::Error> {
//! let settings = common::CopySettings {
//!     max_concurrent_blocks: 64,
//!     block_size: 128 * 1024,
//!     overwrite: true,
//! };
//! let summary = common::copy_file(
//!     &common::PROGRESS,
//!     std::path::Path::new("/dev/sdb"),
//!     std::path::Path::new("/backup/sdb.img"),
//!     &settings,
//!     0,
//! )
//! .await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod block;
pub mod config;
pub mod pipeline;
mod probe;
pub mod progress;
pub mod substrate;

#[cfg(test)]
pub mod testutils;

pub use config::{
    OutputConfig, ProgressSettings, ProgressType, RuntimeConfig, ThrottleConfig, TracingConfig,
};
pub use pipeline::{Settings as CopySettings, Summary as CopySummary, copy};

pub static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

/// Copies `src` into `dst` using the local substrate of the current tokio runtime.
///
/// `chunk_size` is only used for I/O throttling, see [`ThrottleConfig`].
pub async fn copy_file(
    prog_track: &progress::Progress,
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &CopySettings,
    chunk_size: u64,
) -> Result<CopySummary, pipeline::Error> {
    let mut substrate = substrate::LocalSubstrate::new(chunk_size)
        .map_err(|err| pipeline::Error::new(err, Default::default()))?;
    copy(prog_track, &mut substrate, src, dst, settings).await
}

fn verbosity_filter(output: &OutputConfig) -> &'static str {
    if output.quiet && output.verbose == 0 {
        return "off";
    }
    match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(output: &OutputConfig, tracing_config: &TracingConfig) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(verbosity_filter(output)));
    let (stderr_layer, file_layer) = match &tracing_config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed opening log file {:?}", &path))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file));
            (None, Some(layer))
        }
        None => (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        ),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install the tracing subscriber")?;
    Ok(())
}

/// Splits a per-second rate into a refill amount and interval. Rates above 10 refill every
/// 100ms so that tokens arrive smoothly.
fn replenish_schedule(per_second: usize) -> (usize, std::time::Duration) {
    if per_second > 10 {
        (per_second / 10, std::time::Duration::from_millis(100))
    } else {
        (per_second, std::time::Duration::from_secs(1))
    }
}

fn start_throttles(throttle_config: &ThrottleConfig) {
    if throttle_config.ops_throttle > 0 {
        let (replenish, interval) = replenish_schedule(throttle_config.ops_throttle);
        throttle::init_ops_tokens(replenish);
        tokio::spawn(throttle::run_ops_replenish_thread(replenish, interval));
    }
    if throttle_config.iops_throttle > 0 {
        let (replenish, interval) = replenish_schedule(throttle_config.iops_throttle);
        throttle::init_iops_tokens(replenish);
        tokio::spawn(throttle::run_iops_replenish_thread(replenish, interval));
    }
}

async fn show_progress(
    prog_track: &'static progress::Progress,
    progress_type: ProgressType,
    delay: std::time::Duration,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(delay);
    match progress_type {
        ProgressType::ProgressBar => {
            let bar = indicatif::ProgressBar::new(0);
            bar.set_style(
                indicatif::ProgressStyle::with_template(
                    "{spinner} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} \
                     ({bytes_per_sec}, {eta}) {msg}",
                )
                .context("invalid progress bar template")?,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stop => break,
                }
                let blocks = prog_track.blocks.get();
                bar.set_length(prog_track.total_bytes.get());
                bar.set_position(prog_track.bytes_written.get());
                bar.set_message(format!(
                    "{} blocks in flight",
                    blocks.started - blocks.finished
                ));
            }
            bar.finish_and_clear();
        }
        ProgressType::Auto | ProgressType::TextUpdates => {
            let mut printer = progress::ProgressPrinter::new(prog_track);
            // the first tick fires immediately, skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stop => break,
                }
                eprintln!("{}", printer.print());
            }
        }
    }
    Ok(())
}

/// Runs `func` on a freshly built tokio runtime, with logging, throttling and progress reporting
/// configured from the given settings.
///
/// Returns the summary on success. On failure the error is logged (unless quiet) and `None` is
/// returned; the caller is expected to exit with a non-zero status.
pub fn run<Fut, Summary, Error>(
    progress_settings: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    tracing_config: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    if let Err(error) = init_tracing(&output, &tracing_config) {
        eprintln!("{error:#}");
        return None;
    }
    if let Err(error) = throttle_config.validate() {
        tracing::error!("{}", error);
        return None;
    }
    let progress_plan = match progress_settings
        .map(|settings| {
            let progress_type = settings.resolved_type();
            settings
                .delay(progress_type)
                .map(|delay| (progress_type, delay))
        })
        .transpose()
    {
        Ok(plan) => plan,
        Err(error) => {
            tracing::error!("{:#}", error);
            return None;
        }
    };
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to start the tokio runtime: {}", error);
            return None;
        }
    };
    let res = tokio_runtime.block_on(async move {
        start_throttles(&throttle_config);
        let (stop, stopped) = tokio::sync::oneshot::channel();
        let progress_task = progress_plan.map(|(progress_type, delay)| {
            tokio::spawn(show_progress(&PROGRESS, progress_type, delay, stopped))
        });
        let res = func().await;
        if let Some(task) = progress_task {
            // the task may already be gone, in which case there is nothing to stop
            let _ = stop.send(());
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::warn!("progress display failed: {:#}", error),
                Err(error) => tracing::warn!("progress task failed: {}", error),
            }
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", error);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        let output = |quiet, verbose| OutputConfig {
            quiet,
            verbose,
            print_summary: false,
        };
        assert_eq!(verbosity_filter(&output(false, 0)), "error");
        assert_eq!(verbosity_filter(&output(false, 1)), "info");
        assert_eq!(verbosity_filter(&output(false, 2)), "debug");
        assert_eq!(verbosity_filter(&output(false, 7)), "trace");
        assert_eq!(verbosity_filter(&output(true, 0)), "off");
        assert_eq!(verbosity_filter(&output(true, 1)), "info");
    }

    #[test]
    fn fast_rates_refill_every_100ms() {
        assert_eq!(
            replenish_schedule(1000),
            (100, std::time::Duration::from_millis(100))
        );
        assert_eq!(replenish_schedule(5), (5, std::time::Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn copy_file_copies_through_the_local_substrate() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src.bin");
        let dst = tmp_dir.path().join("dst.bin");
        let data: Vec<u8> = (0..100_003u32).map(|i| (i % 241) as u8).collect();
        tokio::fs::write(&src, &data).await?;
        let settings = CopySettings {
            max_concurrent_blocks: 5,
            block_size: 4096,
            overwrite: false,
        };
        let summary = copy_file(&progress::Progress::new(), &src, &dst, &settings, 0).await?;
        assert_eq!(summary.bytes_copied, data.len() as u64);
        assert_eq!(summary.blocks_copied, 25);
        assert!(summary.peak_blocks_in_flight <= 5);
        assert_eq!(tokio::fs::read(&dst).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn copy_file_overwrites_unless_told_not_to() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src.bin");
        let dst = tmp_dir.path().join("dst.bin");
        tokio::fs::write(&src, b"new contents").await?;
        tokio::fs::write(&dst, b"old").await?;
        let settings = CopySettings {
            overwrite: false,
            ..Default::default()
        };
        let error = copy_file(&progress::Progress::new(), &src, &dst, &settings, 0)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("already exists"));
        assert_eq!(tokio::fs::read(&dst).await?, b"old");
        let settings = CopySettings::default();
        assert!(settings.overwrite);
        copy_file(&progress::Progress::new(), &src, &dst, &settings, 0).await?;
        assert_eq!(tokio::fs::read(&dst).await?, b"new contents");
        Ok(())
    }

    #[tokio::test]
    async fn copy_file_truncates_a_longer_destination() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src.bin");
        let dst = tmp_dir.path().join("dst.bin");
        tokio::fs::write(&src, b"short").await?;
        tokio::fs::write(&dst, vec![b'x'; 1000]).await?;
        let settings = CopySettings {
            max_concurrent_blocks: 3,
            block_size: 2,
            overwrite: true,
        };
        copy_file(&progress::Progress::new(), &src, &dst, &settings, 0).await?;
        assert_eq!(tokio::fs::read(&dst).await?, b"short");
        Ok(())
    }

    #[tokio::test]
    async fn copy_file_rejects_a_directory_source() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dst = tmp_dir.path().join("dst.bin");
        let settings = CopySettings {
            max_concurrent_blocks: 1,
            block_size: 4096,
            overwrite: false,
        };
        let error = copy_file(&progress::Progress::new(), tmp_dir.path(), &dst, &settings, 0)
            .await
            .unwrap_err();
        assert!(
            error
                .source
                .downcast_ref::<pipeline::Failure>()
                .is_some_and(|failure| matches!(failure, pipeline::Failure::SizeProbe { .. }))
        );
        Ok(())
    }
}
