use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "class-shroud")]
#[command(about = "Obfuscate a JVM application archive and optionally repackage it behind an encrypting loader")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Repeat for more logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    Obfuscate {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,

        /// Library archive or directory of archives; may be repeated.
        #[arg(long = "lib", value_name = "PATH")]
        libraries: Vec<PathBuf>,

        #[arg(long, value_name = "N")]
        threads: Option<usize>,

        /// Encrypt classes and launch them through a generated loader.
        #[arg(long)]
        package: bool,

        #[arg(long, value_name = "N")]
        seed: Option<u64>,

        #[arg(long, value_name = "PATTERN")]
        include: Vec<String>,

        #[arg(long, value_name = "PATTERN")]
        exclude: Vec<String>,
    },
    Inspect {
        #[arg(value_name = "JAR|CLASS")]
        path: PathBuf,
    },
}
