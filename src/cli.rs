use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "hprof-walker")]
#[command(about = "Inspect JVM heap dumps and query them with path expressions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short = 'f', long, value_enum, global = true, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Objects a reachability filter may visit per candidate
    #[arg(long, global = true, value_name = "N")]
    pub reach_limit: Option<usize>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Dump header and record counts
    Info {
        #[arg(value_name = "DUMP")]
        dump: Option<PathBuf>,
    },
    /// Classes with their instance counts
    Classes {
        #[arg(value_name = "DUMP")]
        dump: Option<PathBuf>,

        /// Class name pattern, e.g. `java.util.*Map`
        #[arg(long, value_name = "PATTERN")]
        filter: Option<String>,
    },
    /// Instance count and payload bytes per class
    Histo {
        #[arg(value_name = "DUMP")]
        dumps: Vec<PathBuf>,

        #[arg(long, value_name = "N", default_value_t = 20)]
        top: usize,
    },
    /// Evaluate a path from every instance of a class
    Walk {
        #[arg(value_name = "DUMP")]
        dump: Option<PathBuf>,

        #[arg(short = 'c', long, value_name = "CLASS")]
        class: String,

        #[arg(short = 'p', long, value_name = "EXPR")]
        path: String,

        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}
