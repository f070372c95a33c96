//! Configuration types for the runner: runtime, throttling, output and progress settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling applied by the local substrate before each transfer
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Operations per second throttle (0 = no throttle)
    pub ops_throttle: usize,
    /// I/O operations per second throttle (0 = no throttle)
    pub iops_throttle: usize,
    /// Chunk size used to count I/O operations per transfer (bytes)
    pub chunk_size: u64,
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.iops_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using iops_throttle".to_string());
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Write log output to this file instead of stderr
    pub log_file: Option<std::path::PathBuf>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(name = "auto", alias = "Auto")]
    Auto,
    #[value(name = "progress-bar", alias = "ProgressBar")]
    ProgressBar,
    #[value(name = "text-updates", alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    /// Resolves `Auto` against whether stderr is a terminal.
    #[must_use]
    pub fn resolved_type(&self) -> ProgressType {
        match self.progress_type {
            ProgressType::Auto => {
                if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
                    ProgressType::ProgressBar
                } else {
                    ProgressType::TextUpdates
                }
            }
            other => other,
        }
    }

    pub fn delay(&self, progress_type: ProgressType) -> anyhow::Result<std::time::Duration> {
        let text = match (&self.progress_delay, progress_type) {
            (Some(delay), _) => delay.as_str(),
            (None, ProgressType::ProgressBar) => "200ms",
            (None, _) => "10s",
        };
        let delay = humantime::parse_duration(text)
            .map_err(|err| anyhow::anyhow!("invalid progress delay {text:?}: {err}"))?;
        if delay.is_zero() {
            return Err(anyhow::anyhow!(
                "invalid progress delay {text:?}: must be greater than zero"
            ));
        }
        Ok(delay)
    }
}
