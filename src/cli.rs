use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, builder::NonEmptyStringValueParser};
use clap_complete::Shell;

use crate::{post_id::PostId, tag_index::IndexLayout};

#[derive(Debug, Parser)]
#[command(
    name = "tagbooru",
    about = "Tag search and post management for an imageboard"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Tag index layout (defaults to whatever the data directory holds,
    /// else the join table)
    #[arg(long, global = true, value_enum)]
    pub layout: Option<IndexLayout>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create, edit, remove and inspect posts
    Post {
        #[command(subcommand)]
        action: PostAction,
    },
    /// Search posts by tag
    Search(SearchArgs),
    /// Most frequent tags among the posts matching a query
    Tags(TagsArgs),
    /// Show store and cache statistics
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Post subcommands --

#[derive(Debug, Subcommand)]
pub enum PostAction {
    /// Add a post
    Add(PostAddArgs),
    /// Replace a post's tags or description
    Edit(PostEditArgs),
    /// Remove a post
    Remove {
        /// Post id
        id: PostId,
    },
    /// Print a post
    Show {
        /// Post id
        id: PostId,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Parser)]
pub struct PostAddArgs {
    /// Uploader name; becomes the post's owner tag
    #[arg(long, value_parser = NonEmptyStringValueParser::new())]
    pub poster: String,

    /// Tags separated by spaces, `+` or `,`
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub tags: String,

    #[arg(long, default_value = "")]
    pub filename: String,

    /// File extension without the dot
    #[arg(long, default_value = "")]
    pub ext: String,

    #[arg(long, default_value = "application/octet-stream")]
    pub mime: String,

    #[arg(long, default_value = "")]
    pub description: String,

    /// Output the created post as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct PostEditArgs {
    /// Post id
    pub id: PostId,

    /// Replacement tags
    #[arg(long, allow_hyphen_values = true)]
    pub tags: Option<String>,

    /// Replacement description
    #[arg(long)]
    pub description: Option<String>,

    /// Owner tag for the new tags (defaults to the original poster)
    #[arg(long, value_parser = NonEmptyStringValueParser::new())]
    pub poster: Option<String>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// Tag terms; prefix with `-` to exclude. Empty matches every post
    #[arg(allow_hyphen_values = true)]
    pub tags: Vec<String>,

    /// Zero-based page number
    #[arg(short, long, default_value = "0")]
    pub page: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Tags --

#[derive(Debug, Parser)]
pub struct TagsArgs {
    /// Tag terms; prefix with `-` to exclude. Empty matches every post
    #[arg(allow_hyphen_values = true)]
    pub tags: Vec<String>,

    /// Number of tags to show (defaults to TAGBOORU_TOP_TAGS or 15)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "tagbooru",
            &mut std::io::stdout(),
        );
    }
}
