use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// nomad - relocate marked methods to remote hosts
#[derive(Debug, Parser)]
#[command(name = "nomad", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Rewrite the nomadic methods of a module into a client and a server module.
    Process {
        /// Path to the code module (binary, or JSON when the extension is .json).
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Dependency module the closures may reach into. Repeatable.
        #[arg(short = 'd', long = "dependency", value_name = "FILE")]
        dependencies: Vec<PathBuf>,

        /// Directory receiving the rewritten client module.
        #[arg(long, value_name = "DIR", default_value = "client")]
        client_dir: PathBuf,

        /// Directory receiving the server copy.
        #[arg(long, value_name = "DIR", default_value = "server")]
        server_dir: PathBuf,

        /// JSON configuration file; its client digest algorithm is used for pairing.
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Print the instructions of a module's methods.
    Disasm {
        /// Path to the code module.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Only methods of types whose full name contains NAME.
        #[arg(long, value_name = "NAME")]
        r#type: Option<String>,

        /// Only methods named NAME.
        #[arg(long, value_name = "NAME")]
        method: Option<String>,
    },

    /// Print the reachable state of every nomadic method.
    Discover {
        /// Path to the code module.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Dependency module the closures may reach into. Repeatable.
        #[arg(short = 'd', long = "dependency", value_name = "FILE")]
        dependencies: Vec<PathBuf>,

        /// Only methods of types whose full name contains NAME.
        #[arg(long, value_name = "NAME")]
        r#type: Option<String>,
    },

    /// Compute module content digests.
    Hash {
        /// Files to hash.
        #[arg(value_name = "FILE", required = true)]
        paths: Vec<PathBuf>,

        /// Digest algorithm: sha1 or md5.
        #[arg(short, long, default_value = "sha1")]
        algorithm: String,
    },
}
