use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "codebox", about = "Run code in an embedded interpreter", version)]
pub struct Cli {
    /// Source file to run; reads stdin when omitted.
    #[arg(value_name = "FILE")]
    pub file: Option<String>,

    /// Inline source to run instead of a file.
    #[arg(short = 'c', long = "code", conflicts_with = "file")]
    pub code: Option<String>,

    /// Evaluation timeout in seconds; 0 uses the configured default.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Interpreter program (overrides CODEBOX_INTERPRETER).
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Prelude script location, URL or path (overrides CODEBOX_PRELUDE).
    #[arg(long)]
    pub prelude: Option<String>,

    /// Do not fail the run when the code writes to stderr.
    #[arg(long = "allow-stderr")]
    pub allow_stderr: bool,

    /// Print the final result as JSON instead of streaming output.
    #[arg(long)]
    pub json: bool,

    /// Default log filter (overridden by RUST_LOG).
    #[arg(long = "log-level", default_value = "warn")]
    pub log_level: String,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.filter(|secs| *secs > 0).map(Duration::from_secs)
    }
}
