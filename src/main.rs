use clap::Parser;
use tagbooru::{
    DataDir,
    EngineConfig,
    NewPost,
    PostEdit,
    SearchEngine,
    cli::{self, Cli, Command, PostAction},
    error,
    post::Post,
    query::parse_tag_string,
    search,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("TAGBOORU_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let layout = cli.layout.unwrap_or_else(|| data_dir.detect_layout());
    let config = EngineConfig::from_env()?;
    let engine = search::open_engine(layout, &data_dir, config)?;
    let cancel = CancellationToken::new();

    match cli.command {
        Command::Post { action } => match action {
            PostAction::Add(args) => post_add(&engine, args)?,
            PostAction::Edit(args) => post_edit(&engine, args)?,
            PostAction::Remove { id } => {
                let removed = engine.delete_post(id)?;
                println!("Removed post #{}", removed.id);
            }
            PostAction::Show { id, json } => {
                let post = engine.post(id)?;
                if json {
                    search::format_json(&post)?;
                } else {
                    print_post(&post);
                }
            }
        },
        Command::Search(args) => {
            let page =
                engine.search_terms(&args.tags, args.page, &cancel)?;
            if args.json {
                search::format_json(&page)?;
            } else {
                search::format_human(&page);
            }
        }
        Command::Tags(args) => {
            let n = args.count.unwrap_or(engine.config().top_tags);
            let raw = args.tags.join(" ");
            let tags = engine.top_tags(&raw, n, &cancel)?;
            if args.json {
                search::format_json(&tags)?;
            } else if tags.is_empty() {
                println!("No tags found.");
            } else {
                for t in &tags {
                    println!("{:>6}  {}", t.count, t.tag);
                }
            }
        }
        Command::Status(args) => {
            cmd_status(&engine, &data_dir, args.json)?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn post_add(engine: &SearchEngine, args: cli::PostAddArgs) -> error::Result<()> {
    let post = engine.create_post(NewPost {
        filename: args.filename,
        extension: args.ext,
        description: args.description,
        poster: args.poster,
        mime_type: args.mime,
        tags: parse_tag_string(&args.tags),
    })?;

    if args.json {
        search::format_json(&post)?;
    } else {
        println!("Created post #{}", post.id);
        println!("  tags: {}", post.tags.join(" "));
    }
    Ok(())
}

fn post_edit(
    engine: &SearchEngine,
    args: cli::PostEditArgs,
) -> error::Result<()> {
    let post = engine.edit_post(
        args.id,
        PostEdit {
            tags: args.tags.as_deref().map(parse_tag_string),
            description: args.description,
            editor: args.poster,
        },
    )?;
    println!("Updated post #{}", post.id);
    println!("  tags: {}", post.tags.join(" "));
    Ok(())
}

fn print_post(post: &Post) {
    println!("Post #{}", post.id);
    println!("  file: {}.{} ({})", post.filename, post.extension, post.mime_type);
    println!("  poster: {}", post.poster);
    println!("  created: {}", post.created_at);
    println!("  tags: {}", post.tags.join(" "));
    if !post.description.is_empty() {
        println!("  description: {}", post.description);
    }
}

fn cmd_status(
    engine: &SearchEngine,
    data_dir: &DataDir,
    json: bool,
) -> error::Result<()> {
    let posts = engine.post_count()?;
    let config = engine.config();

    if json {
        search::format_json(&serde_json::json!({
            "data_dir": data_dir.root(),
            "layout": engine.layout().to_string(),
            "posts": posts,
            "page_size": config.page_size,
            "search_ttl_ms": config.search_ttl.as_millis() as u64,
            "tag_counts_ttl_ms": config.tag_counts_ttl.as_millis() as u64,
        }))?;
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Layout: {}", engine.layout());
        println!("Posts: {posts}");
        println!("Page size: {}", config.page_size);
        println!(
            "Cache TTLs: search {:?}, tag counts {:?}",
            config.search_ttl, config.tag_counts_ttl
        );
    }
    Ok(())
}
