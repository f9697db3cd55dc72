use clap::{Parser, Subcommand};

use crate::providers::ProviderKind;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Classify keywords into the taxonomy
    Submit {
        /// Keywords to classify. Read from --file or stdin when omitted
        keywords: Vec<String>,

        /// File with one keyword per line
        #[clap(short, long)]
        file: Option<String>,

        /// Language code of the keywords
        #[clap(short, long)]
        language: Option<String>,

        /// openai, gemini, claude or mistral
        #[clap(short, long, default_value = "openai")]
        provider: ProviderKind,

        /// Use this prompt version instead of the active one
        #[clap(long)]
        prompt_version: Option<String>,

        /// Re-classify keywords that already have a row
        #[clap(long, default_value = "false")]
        force: bool,
    },

    /// Classify keywords from a CSV file, one batch per language
    Import {
        path: String,

        #[clap(short, long, default_value = "openai")]
        provider: ProviderKind,

        /// Language for rows without a language column
        #[clap(short, long)]
        language: Option<String>,

        #[clap(long)]
        prompt_version: Option<String>,

        #[clap(long, default_value = "false")]
        force: bool,
    },

    /// Write all rows as CSV
    Export {
        /// Output file, stdout if omitted
        #[clap(short, long)]
        output: Option<String>,
    },

    /// Load a file produced by `export`
    Restore { path: String },

    /// Browse stored rows
    Query {
        #[clap(long)]
        main_cat: Option<String>,

        #[clap(long)]
        sub_cat_1: Option<String>,

        #[clap(long)]
        sub_cat_2: Option<String>,

        #[clap(short, long)]
        language: Option<String>,

        #[clap(long)]
        page: Option<usize>,

        #[clap(long)]
        per_page: Option<usize>,

        /// Print only the number of matching rows
        #[clap(short, long, default_value = "false")]
        count: bool,
    },

    /// Print the category tree
    Taxonomy {
        /// Print the digest sent to classifiers instead
        #[clap(long, default_value = "false")]
        digest: bool,

        /// Print nodes as json
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Manage prompt templates
    Prompt {
        #[command(subcommand)]
        action: PromptAction,
    },

    /// Serve the HTTP api
    Daemon {
        #[clap(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PromptAction {
    /// List versions
    List,

    /// Print a template, the active one by default
    Show { version: Option<String> },

    /// Store a new template read from a file
    Add {
        file: String,

        /// Make it the active version
        #[clap(long, default_value = "false")]
        activate: bool,
    },

    /// Make a version active
    Activate { version: String },
}
