use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::{Cli, Commands};

/// Everything one obfuscation run needs. Loaded from an optional JSON file,
/// then overridden by command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    #[serde(skip)]
    pub input: PathBuf,
    #[serde(skip)]
    pub output: PathBuf,
    pub libraries: Vec<PathBuf>,
    /// Worker threads; the host's available parallelism when unset.
    pub threads: Option<usize>,
    pub package: bool,
    pub seed: Option<u64>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub passes: PassesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassesConfig {
    pub rename_classes: bool,
    /// Package that renamed classes move into. Each class keeps its own
    /// package when unset.
    pub rename_package: Option<String>,
    pub remove_line_numbers: bool,
    pub hide_members: bool,
    pub shuffle_members: bool,
}

impl Default for PassesConfig {
    fn default() -> Self {
        Self {
            rename_classes: false,
            rename_package: None,
            remove_line_numbers: true,
            hide_members: true,
            shuffle_members: true,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            libraries: Vec::new(),
            threads: None,
            package: false,
            seed: None,
            include: Vec::new(),
            exclude: Vec::new(),
            passes: PassesConfig::default(),
        }
    }
}

impl JobConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.threads
            .filter(|&n| n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }
}

/// `<config dir>/class-shroud/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("class-shroud").join("config.json"))
}

/// Reads a config file. Without an explicit path the default location is
/// tried and defaults are used when nothing is there.
pub fn load_config(explicit: Option<&Path>) -> Result<JobConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => return Ok(JobConfig::default()),
        },
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Builds the job for `obfuscate`, applying command-line overrides on top of
/// the config file.
pub fn resolve_job_config(cli: &Cli) -> Result<JobConfig> {
    let Commands::Obfuscate {
        input,
        output,
        libraries,
        threads,
        package,
        seed,
        include,
        exclude,
    } = &cli.command
    else {
        anyhow::bail!("job configuration is only available for the obfuscate command");
    };

    let mut config = load_config(cli.config.as_deref())?;
    config.input = input.clone();
    config.output = output.clone();
    // command-line libraries come last so they shadow configured ones
    config.libraries.extend(libraries.iter().cloned());
    if threads.is_some() {
        config.threads = *threads;
    }
    config.package |= *package;
    if seed.is_some() {
        config.seed = *seed;
    }
    if !include.is_empty() {
        config.include = include.clone();
    }
    if !exclude.is_empty() {
        config.exclude = exclude.clone();
    }
    Ok(config)
}
