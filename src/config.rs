use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

/// Image tag prefix prepended to every language's image name.
pub const DEFAULT_IMAGE_PREFIX: &str = "koneko-online-judge-image-";

/// Batch-runner script location, relative to the worker's working
/// directory.
pub const DEFAULT_JUDGE_SCRIPT: &str = "./judge.sh";

#[derive(Parser)]
#[command(name = "koneko-judge", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Enable debug logging
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn read_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Number of concurrent judging workers
    pub workers: u8,
    #[serde(default = "default_image_prefix")]
    pub image_name_prefix: String,
    #[serde(default = "default_judge_script")]
    pub judge_script: PathBuf,
    /// Overrides the platform-specific default database location
    pub database_path: Option<PathBuf>,
}

fn default_image_prefix() -> String {
    DEFAULT_IMAGE_PREFIX.to_string()
}

fn default_judge_script() -> PathBuf {
    PathBuf::from(DEFAULT_JUDGE_SCRIPT)
}
