use anyhow::anyhow;
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ringcp",
    version,
    about = "Copy a file or block device with a bounded number of blocks in flight",
    long_about = "`ringcp` copies the full contents of a regular file or block device into a destination file.

The source is split into fixed-size blocks. Up to --max-blocks of them are read and written concurrently, each block landing at the same offset in the destination. Short reads and writes are resumed and transient errors retried; any other I/O error stops the copy. An existing destination is truncated and overwritten unless --no-clobber is given.

EXAMPLES:
    # Image a disk with progress
    ringcp /dev/sdb /backup/sdb.img --progress --summary

    # Copy using 1MiB blocks, never replacing an existing file
    ringcp big.bin copy.bin --no-clobber --block-size 1MiB --max-blocks 16"
)]
struct Args {
    // Copy options
    /// Fail instead of overwriting the destination if it already exists
    #[arg(short = 'n', long, help_heading = "Copy options")]
    no_clobber: bool,

    /// Maximum number of blocks being read or written at the same time
    #[arg(
        long,
        default_value = "64",
        value_name = "N",
        help_heading = "Copy options"
    )]
    max_blocks: usize,

    /// Size of each block
    ///
    /// Accepts byte sizes like "128KiB", "1MiB", or plain numbers in bytes.
    #[arg(
        long,
        default_value = "128KiB",
        value_name = "SIZE",
        help_heading = "Copy options"
    )]
    block_size: bytesize::ByteSize,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Write log output to this file instead of stderr
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    log_file: Option<std::path::PathBuf>,

    // Performance & throttling
    /// Throttle the number of operations per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Throttle the number of I/O operations per second, 0 means no throttle
    ///
    /// I/O is calculated based on provided chunk size -- number of I/O operations for a read or
    /// write is calculated as: ((length - 1) / chunk size) + 1
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    /// Chunk size used to calculate number of I/O per read or write
    ///
    /// Modifying this setting to a value > 0 is REQUIRED when using --iops-throttle.
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    chunk_size: bytesize::ByteSize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source file or block device
    #[arg()]
    src: std::path::PathBuf,

    /// Destination file
    #[arg()]
    dst: std::path::PathBuf,
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<common::CopySummary> {
    let block_size = usize::try_from(args.block_size.as_u64())
        .map_err(|_| anyhow!("block size {} is too large", args.block_size))?;
    let settings = common::CopySettings {
        max_concurrent_blocks: args.max_blocks,
        block_size,
        overwrite: !args.no_clobber,
    };
    match common::copy_file(
        &common::PROGRESS,
        &args.src,
        &args.dst,
        &settings,
        args.chunk_size.as_u64(),
    )
    .await
    {
        Ok(summary) => Ok(summary),
        Err(error) => {
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let show_progress =
        args.progress || args.progress_type.is_some() || args.progress_delay.is_some();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        ops_throttle: args.ops_throttle,
        iops_throttle: args.iops_throttle,
        chunk_size: args.chunk_size.as_u64(),
    };
    let tracing = common::TracingConfig {
        log_file: args.log_file.clone(),
    };
    let res = common::run(
        if show_progress {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        tracing,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
