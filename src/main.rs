//! Plover - A terminal photo-feed client for Bluesky
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use plover::api::ImageUpload;
use plover::events::{EventKind, SessionEvent, Subscription};
use plover::{
    AgentFactory, BlueskyGateway, Config, EventBus, SessionManager, SessionStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (RUST_LOG=debug for verbose output)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match parse_args()? {
        Command::Login { identifier } => login_cli(identifier.as_deref()).await,
        Command::Accounts => list_accounts().await,
        Command::Switch { account } => switch_cli(&account).await,
        Command::Logout => logout_cli(false).await,
        Command::LogoutAll => logout_cli(true).await,
        Command::Timeline { limit } => timeline_cli(limit).await,
        Command::Post { text, image } => post_cli(&text, image.as_deref()).await,
        Command::Like { uri, cid } => like_cli(&uri, &cid).await,
        Command::Unlike { uri } => unlike_cli(&uri).await,
        Command::Search { query, limit } => search_cli(&query, limit).await,
        Command::Profile { actor } => profile_cli(actor.as_deref()).await,
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Version => {
            print_version();
            Ok(())
        }
    }
}

/// CLI commands
enum Command {
    Login { identifier: Option<String> },
    Accounts,
    Switch { account: String },
    Logout,
    LogoutAll,
    Timeline { limit: Option<usize> },
    Post { text: String, image: Option<String> },
    Like { uri: String, cid: String },
    Unlike { uri: String },
    Search { query: String, limit: Option<usize> },
    Profile { actor: Option<String> },
    Help,
    Version,
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() == 1 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "-h" | "--help" | "help" => Ok(Command::Help),
        "-v" | "--version" | "version" => Ok(Command::Version),

        "login" => Ok(Command::Login {
            identifier: args.get(2).cloned(),
        }),

        "accounts" => Ok(Command::Accounts),

        "switch" => {
            let account = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("Missing account (handle or DID)"))?
                .clone();
            Ok(Command::Switch { account })
        }

        "logout" => {
            if args.get(2).map(String::as_str) == Some("--all") {
                Ok(Command::LogoutAll)
            } else {
                Ok(Command::Logout)
            }
        }

        "timeline" | "tl" => Ok(Command::Timeline {
            limit: flag_value(&args, "--limit", "-l"),
        }),

        "post" => {
            let text = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("Missing post text"))?
                .clone();
            let image = args
                .iter()
                .position(|a| a == "--image" || a == "-i")
                .and_then(|i| args.get(i + 1))
                .cloned();
            Ok(Command::Post { text, image })
        }

        "like" => {
            let uri = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("Missing post URI"))?
                .clone();
            let cid = args
                .get(3)
                .ok_or_else(|| anyhow::anyhow!("Missing post CID"))?
                .clone();
            Ok(Command::Like { uri, cid })
        }

        "unlike" => {
            let uri = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("Missing post URI"))?
                .clone();
            Ok(Command::Unlike { uri })
        }

        "search" => {
            let query = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("Missing search query"))?
                .clone();
            let limit = flag_value(&args, "--limit", "-l");
            Ok(Command::Search { query, limit })
        }

        "profile" => Ok(Command::Profile {
            actor: args.get(2).cloned(),
        }),

        other => Err(anyhow::anyhow!(
            "Unknown command: {other}\nRun 'plover --help' for usage"
        )),
    }
}

fn flag_value(args: &[String], long: &str, short: &str) -> Option<usize> {
    args.iter()
        .position(|a| a == long || a == short)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn print_help() {
    let config_path = Config::default_path()
        .map_or_else(|_| "Unknown".to_string(), |p| p.display().to_string());

    println!(
        r#"📷 Plover - A terminal photo-feed client for Bluesky

USAGE:
    plover [COMMAND]

COMMANDS:
    login [identifier]                 Log in (bare names get .bsky.social)
      Examples:
        plover login alice
        plover login alice.example.com
        plover login alice@example.com

    accounts                           List logged-in accounts
    switch <handle|did>                Make another account current
    logout [--all]                     Log out current account (or every one)

    timeline [OPTIONS]                 Show the photo timeline
      Options:
        -l, --limit <n>                Number of photos (default: post_limit from config)

    post <text> [OPTIONS]              Create a post
      Options:
        -i, --image <path>             Attach an image

    like <uri> <cid>                   Like a post
    unlike <uri>                       Remove your like from a post
    search <query> [OPTIONS]           Search photo posts
    profile [handle|did]               Show a profile (default: yours)

OPTIONS:
    -h, --help                         Show this help message
    -v, --version                      Show version information

CONFIG:
    {}
"#,
        config_path
    );
}

fn print_version() {
    println!("plover {}", plover::VERSION);
}

/// Bootstrapped session stack shared by every command
struct App {
    manager: Arc<SessionManager<BlueskyGateway>>,
    config: Config,
    // Keeps the "session expired" notice alive for the process lifetime.
    _dropped_notice: Subscription,
}

/// Build and hydrate the session manager.
///
/// This is the single explicit initialization entry point; nothing session
/// related runs before it.
async fn bootstrap() -> Result<App> {
    let config = Config::load()?;
    let store = SessionStore::open()?;
    let bus = EventBus::new();

    let dropped_notice = bus.subscribe(EventKind::SessionDropped, |event| {
        if let SessionEvent::SessionDropped { did } = event {
            match did {
                Some(did) => eprintln!("Session expired for {did}. Please log in again."),
                None => eprintln!("Session expired. Please log in again."),
            }
        }
    });

    let factory = AgentFactory::new(
        BlueskyGateway::new(),
        config.service.clone(),
        config.handle_suffix.clone(),
    );
    let manager = SessionManager::new(factory, store, bus, config.refresh_interval_secs);
    manager.initialize().await;

    Ok(App {
        manager,
        config,
        _dropped_notice: dropped_notice,
    })
}

async fn login_cli(identifier: Option<&str>) -> Result<()> {
    let app = bootstrap().await?;

    let identifier = match identifier {
        Some(identifier) => identifier.to_string(),
        None => {
            println!("Enter your handle or email:");
            read_line()?
        }
    };

    println!("Enter your app password:");
    println!("(Create one at https://bsky.app/settings/app-passwords)");
    let password = read_line()?;

    match app.manager.login(&identifier, &password, "Cli").await {
        Ok(credential) => {
            println!("\n✓ Logged in as @{}", credential.handle);
            Ok(())
        }
        Err(plover::SessionError::RateLimited { retry_after }) => {
            if let Some(wait) = retry_after {
                Err(anyhow::anyhow!(
                    "Too many attempts. Try again in {} seconds.",
                    wait.as_secs()
                ))
            } else {
                Err(anyhow::anyhow!("Too many attempts. Try again later."))
            }
        }
        Err(e) => Err(e.into()),
    }
}

async fn list_accounts() -> Result<()> {
    let app = bootstrap().await?;
    let accounts = app.manager.accounts();

    if accounts.is_empty() {
        println!("No accounts logged in.");
        println!("\nLog in with:");
        println!("  plover login <handle>");
        return Ok(());
    }

    let current = app.manager.current_account().map(|a| a.did);

    println!("Logged-in accounts:\n");
    for account in accounts {
        let marker = if current.as_deref() == Some(&account.did) {
            " (current)"
        } else {
            ""
        };
        println!("  @{}{}\n    {}", account.handle, marker, account.did);
    }

    Ok(())
}

async fn switch_cli(account: &str) -> Result<()> {
    let app = bootstrap().await?;

    // Accept a handle as well as a DID.
    let did = app
        .manager
        .accounts()
        .into_iter()
        .find(|a| a.handle == account.trim_start_matches('@') || a.did == account)
        .map_or_else(|| account.to_string(), |a| a.did);

    let credential = app.manager.switch_account(&did)?;
    println!("✓ Switched to @{}", credential.handle);
    Ok(())
}

async fn logout_cli(all: bool) -> Result<()> {
    let app = bootstrap().await?;

    if all {
        app.manager.logout_every_account("Cli").await?;
        println!("✓ Logged out of every account");
    } else {
        let Some(account) = app.manager.current_account() else {
            println!("No account is logged in.");
            return Ok(());
        };
        app.manager.logout_current_account("Cli").await?;
        println!("✓ Logged out @{}", account.handle);
        if let Some(next) = app.manager.current_account() {
            println!("  Now using @{}", next.handle);
        }
    }

    Ok(())
}

async fn timeline_cli(limit: Option<usize>) -> Result<()> {
    let app = bootstrap().await?;
    let agent = app.manager.current_agent().await?;

    let limit = limit.unwrap_or(app.config.post_limit);
    let (posts, _cursor) = agent.photo_timeline(limit, None).await?;

    if posts.is_empty() {
        println!("No photos in your timeline right now.");
        return Ok(());
    }

    for post in posts {
        print_post(&post);
    }
    Ok(())
}

async fn post_cli(text: &str, image: Option<&str>) -> Result<()> {
    let app = bootstrap().await?;
    let agent = app.manager.current_agent().await?;

    let upload = match image {
        Some(path) => {
            let bytes = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read image {path}: {e}"))?;
            Some(ImageUpload {
                bytes,
                mime_type: mime_for(path).to_string(),
                alt: Some(text.to_string()),
            })
        }
        None => None,
    };

    println!("Posting...");
    let uri = agent.create_post(text, upload).await?;
    println!("✓ Posted: {uri}");
    Ok(())
}

async fn like_cli(uri: &str, cid: &str) -> Result<()> {
    let app = bootstrap().await?;
    let agent = app.manager.current_agent().await?;
    agent.like(uri, cid).await?;
    println!("✓ Liked");
    Ok(())
}

async fn unlike_cli(uri: &str) -> Result<()> {
    let app = bootstrap().await?;
    let agent = app.manager.current_agent().await?;
    agent.unlike(uri).await?;
    println!("✓ Unliked");
    Ok(())
}

async fn search_cli(query: &str, limit: Option<usize>) -> Result<()> {
    let app = bootstrap().await?;
    let agent = app.manager.current_agent().await?;

    let limit = limit.unwrap_or(app.config.post_limit);
    let (posts, _cursor) = agent.search_photos(query, limit, "latest", None).await?;

    if posts.is_empty() {
        println!("No photo posts found for '{query}'.");
        return Ok(());
    }

    for post in posts {
        print_post(&post);
    }
    Ok(())
}

async fn profile_cli(actor: Option<&str>) -> Result<()> {
    let app = bootstrap().await?;
    let agent = app.manager.current_agent().await?;

    let actor = match actor {
        Some(actor) => actor.trim_start_matches('@').to_string(),
        None => agent.did().to_string(),
    };

    let profile = agent.get_profile(&actor).await?;

    println!(
        "@{} {}",
        profile.handle,
        profile.display_name.unwrap_or_default()
    );
    if let Some(description) = profile.description {
        println!("{description}");
    }
    println!(
        "{} posts · {} followers · {} following",
        profile.posts_count, profile.followers_count, profile.follows_count
    );

    let (photos, _cursor) = agent.author_photos(&profile.did, 6, None).await?;
    for post in photos {
        print_post(&post);
    }
    Ok(())
}

fn print_post(post: &plover::PhotoPost) {
    println!(
        "\n@{} · {}",
        post.author_handle,
        post.relative_time()
    );
    if !post.text.is_empty() {
        println!("{}", post.preview(200));
    }
    for image in &post.images {
        println!("  🖼  {}", image.fullsize);
    }
    let liked = if post.liked { "♥" } else { "♡" };
    println!("{} {}  {}", liked, post.like_count, post.web_url());
}

fn mime_for(path: &str) -> &'static str {
    match path.rsplit('.').next().map(str::to_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

fn read_line() -> Result<String> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
