use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command line of the tenant-storage operator tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "tenant-storage")]
#[command(about = "Inspect and operate a tenant's file storage provider")]
pub struct Config {
    /// Provider name (localfs, nas, ...)
    #[arg(long, env = "TENANT_STORAGE_PROVIDER", global = true)]
    pub provider: Option<String>,

    /// Path to a JSON file holding the provider configuration
    #[arg(long, env = "TENANT_STORAGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List registered providers
    Providers,

    /// Run the provider health check
    Health,

    /// List a directory
    Ls {
        /// Directory relative to the provider base
        path: Option<String>,

        /// Glob applied to file names
        #[arg(long)]
        pattern: Option<String>,

        #[arg(long, short)]
        recursive: bool,
    },

    /// Print a file to stdout
    Cat { path: String },

    /// Upload a local file
    Put {
        /// Local file to upload
        source: PathBuf,

        /// Destination path on the provider
        path: String,

        #[arg(long)]
        overwrite: bool,
    },

    /// Insert or update one row of the quote spreadsheet
    UpdateQuote {
        #[arg(long)]
        tenant_id: String,

        #[arg(long)]
        quote_id: String,

        #[arg(long, default_value_t = 0.0)]
        total: f64,

        #[arg(long, default_value = "pending")]
        status: String,

        #[arg(long, default_value = "")]
        notes: String,

        #[arg(long, default_value = "")]
        customer_name: String,

        #[arg(long, default_value = "")]
        customer_email: String,

        #[arg(long, default_value = "")]
        customer_phone: String,
    },

    /// Poll a directory and print change events until interrupted
    Watch {
        /// Directory relative to the provider base
        path: Option<String>,

        /// Poll interval in seconds
        #[arg(long, default_value_t = 5)]
        interval: u64,

        #[arg(long)]
        pattern: Option<String>,

        /// Only watch the top level
        #[arg(long)]
        no_recursive: bool,
    },
}
