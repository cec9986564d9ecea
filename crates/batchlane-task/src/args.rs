//! Command-line arguments shared by the task programs
//!
//! The flag names match the placeholders of the default task template.

use std::path::PathBuf;

/// Parse a yes/no flag value
///
/// Accepts `true|false|yes|no|y|n|1|0` in any case. Anything else is an
/// error rather than a silent "no".
pub fn parse_flag(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Ok(true),
        "false" | "no" | "n" | "0" => Ok(false),
        other => Err(format!(
            "'{}' is not a yes/no value (expected true, false, yes, no, y, n, 1 or 0)",
            other
        )),
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct CommonArgs {
    /// Input file, relative to the task working directory
    #[arg(long)]
    pub filepath: PathBuf,

    #[arg(long)]
    pub storage_account: String,

    /// `file://` endpoint of the storage account
    #[arg(long)]
    pub storage_endpoint: Option<String>,

    #[arg(long)]
    pub output_container: String,

    /// Write grant for the output container
    #[arg(long)]
    pub output_token: String,

    #[arg(long)]
    pub logging_container: String,

    /// Write grant for the logging container
    #[arg(long)]
    pub logging_token: String,

    /// Position of the input within the job
    #[arg(long, default_value_t = 0)]
    pub idx: usize,

    /// Local development run: no blob or document writes
    #[arg(long, default_value = "false", value_parser = parse_flag, action = clap::ArgAction::Set)]
    pub dev: bool,
}

impl CommonArgs {
    /// File name of the input, as used in blob names
    pub fn file_name(&self) -> String {
        self.filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.filepath.display().to_string())
    }
}
