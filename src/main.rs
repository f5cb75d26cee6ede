//! Redreach CLI entry point.
//!
//! Subcommands for drafting and sending outreach DMs, recording outcomes,
//! inspecting quota windows, discovering contacts, and sweeping subreddits.
//! Each invocation is one self-contained unit of work: open the store, run
//! a single core operation, print the result, exit.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tracing::{info, warn};

use redreach::backoff::BackoffPolicy;
use redreach::config::Config;
use redreach::credentials::{self, save_user_credential, UserCredential};
use redreach::delivery::{self, DeliveryEngine, Disposition, MessageOutcome, OutreachMessage};
use redreach::discovery::{
    DiscoveryCache, EngagementScorer, OpportunityProfile, RecencyKarmaScorer,
    RedditCandidateSource,
};
use redreach::logging;
use redreach::quota::{QuotaKind, QuotaManager};
use redreach::reddit::{FetchMode, FetchOptions, RedditClient};
use redreach::store;

/// Redreach command line for quota-guarded Reddit outreach.
#[derive(Parser)]
#[command(name = "redreach", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create the database schema and verify the configuration.
    Init,
    /// Persist a drafted direct message and print its id.
    Draft {
        /// Sending user id.
        #[arg(long)]
        user: String,
        /// Recipient Reddit username (no `u/` prefix).
        #[arg(long)]
        to: String,
        /// Message subject line.
        #[arg(long)]
        subject: String,
        /// Message body text.
        #[arg(long)]
        body: String,
    },
    /// Send a drafted (or previously failed) message.
    Send {
        /// Message id from `draft`.
        #[arg(long)]
        message: String,
        /// Replacement body to deliver instead of the drafted text.
        #[arg(long)]
        body: Option<String>,
    },
    /// Record what became of a sent message.
    Outcome {
        /// Message id.
        #[arg(long)]
        message: String,
        /// One of: no_response, replied, call_scheduled, customer_acquired.
        #[arg(long)]
        outcome: String,
    },
    /// Show a user's outbound-message window.
    Quota {
        /// User id.
        #[arg(long)]
        user: String,
    },
    /// List ranked outreach contacts for an opportunity.
    Discover {
        /// Opportunity id, the discovery cache key.
        #[arg(long)]
        opportunity: String,
        /// Comma-separated search keywords.
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
        /// Comma-separated subreddits (no `r/` prefix).
        #[arg(long, value_delimiter = ',')]
        subreddits: Vec<String>,
        /// Page to show, 1-based.
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Contacts per page (0 means the configured default).
        #[arg(long, default_value_t = 0)]
        page_size: u32,
        /// Drop any cached run and re-discover.
        #[arg(long)]
        refresh: bool,
    },
    /// Fetch recent posts across subreddits and print them as JSON lines.
    Sweep {
        /// Comma-separated subreddits (no `r/` prefix).
        #[arg(long, value_delimiter = ',')]
        subreddits: Vec<String>,
        /// Search query; omit to take the newest posts instead.
        #[arg(long)]
        query: Option<String>,
        /// Posts per subreddit.
        #[arg(long, default_value_t = 25)]
        limit: u32,
        /// Search time filter (hour, day, week, month, year, all).
        #[arg(long, default_value = "week")]
        window: String,
    },
    /// Store a user's OAuth tokens obtained out-of-band.
    Connect {
        /// User id the tokens belong to.
        #[arg(long)]
        user: String,
        /// OAuth access token.
        #[arg(long)]
        access_token: String,
        /// OAuth refresh token.
        #[arg(long)]
        refresh_token: String,
        /// Access-token lifetime in seconds from now.
        #[arg(long, default_value_t = 3600)]
        expires_in: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Init => handle_init().await,
        Command::Draft {
            user,
            to,
            subject,
            body,
        } => handle_draft(&user, &to, &subject, &body).await,
        Command::Send { message, body } => handle_send(&message, body.as_deref()).await,
        Command::Outcome { message, outcome } => handle_outcome(&message, &outcome).await,
        Command::Quota { user } => handle_quota(&user).await,
        Command::Discover {
            opportunity,
            keywords,
            subreddits,
            page,
            page_size,
            refresh,
        } => handle_discover(&opportunity, keywords, subreddits, page, page_size, refresh).await,
        Command::Sweep {
            subreddits,
            query,
            limit,
            window,
        } => handle_sweep(subreddits, query, limit, window).await,
        Command::Connect {
            user,
            access_token,
            refresh_token,
            expires_in,
        } => handle_connect(&user, &access_token, &refresh_token, expires_in).await,
    }
}

/// Load config and open the shared SQLite store.
async fn open_store() -> anyhow::Result<(Config, SqlitePool)> {
    let config = Config::load().context("failed to load configuration")?;
    let db = store::open(Path::new(&config.paths.db))
        .await
        .with_context(|| format!("failed to open database at {}", config.paths.db))?;
    Ok((config, db))
}

/// Assemble the Reddit client from app credentials and config.
fn build_client(config: &Config, db: &SqlitePool) -> anyhow::Result<Arc<RedditClient>> {
    let app_credentials = credentials::load_default_app_credentials()
        .context("failed to load app credentials (.env)")?;
    let backoff = BackoffPolicy::new(&config.backoff);
    let quota = QuotaManager::new(db.clone(), config.quota.clone());
    Ok(Arc::new(RedditClient::new(
        config.reddit.clone(),
        app_credentials,
        backoff,
        quota,
    )))
}

/// Create the database schema and verify the configuration.
async fn handle_init() -> anyhow::Result<()> {
    logging::init_cli();
    let (config, db) = open_store().await?;
    db.close().await;

    info!(db = %config.paths.db, "database ready");
    info!("put REDDIT_CLIENT_ID and REDDIT_CLIENT_SECRET in .env before sending");
    Ok(())
}

/// Persist a draft and print its id for later `send`.
async fn handle_draft(user: &str, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
    logging::init_cli();
    let (_config, db) = open_store().await?;

    let message = OutreachMessage::new_draft(user, to, subject, body);
    delivery::insert_message(&db, &message)
        .await
        .context("failed to persist draft")?;

    println!("{}", message.id);
    Ok(())
}

/// Run a drafted message through the delivery engine.
async fn handle_send(message_id: &str, body: Option<&str>) -> anyhow::Result<()> {
    logging::init_cli();
    let (config, db) = open_store().await?;
    let client = build_client(&config, &db)?;
    let quota = QuotaManager::new(db.clone(), config.quota.clone());
    let engine = DeliveryEngine::new(db.clone(), quota, client, config.reddit.refresh_margin_secs);

    let receipt = engine.send_message(message_id, body).await?;
    match receipt.disposition {
        Disposition::Sent => println!(
            "sent: {} (quota remaining: {})",
            receipt.message_id, receipt.quota_remaining
        ),
        Disposition::AlreadySent => println!("already sent: {}", receipt.message_id),
        Disposition::AlreadyInProgress => {
            println!("send already in progress: {}", receipt.message_id);
        }
    }
    Ok(())
}

/// Record a sent message's outcome.
async fn handle_outcome(message_id: &str, outcome: &str) -> anyhow::Result<()> {
    logging::init_cli();
    let (_config, db) = open_store().await?;

    let parsed = MessageOutcome::parse(outcome).map_err(|_| {
        anyhow::anyhow!(
            "unknown outcome '{outcome}' \
             (expected no_response, replied, call_scheduled, or customer_acquired)"
        )
    })?;
    delivery::record_outcome(&db, message_id, parsed).await?;

    println!("recorded {} for {}", parsed.as_str(), message_id);
    Ok(())
}

/// Print a user's outbound-message window without consuming from it.
async fn handle_quota(user: &str) -> anyhow::Result<()> {
    logging::init_cli();
    let (config, db) = open_store().await?;
    let quota = QuotaManager::new(db.clone(), config.quota.clone());

    let status = quota.peek(user, QuotaKind::OutboundMessage).await?;
    println!(
        "outbound messages: {}/{} used, {} remaining",
        status.used, status.limit, status.remaining
    );
    match status.reset_at {
        Some(at) => println!("window resets at {}", at.to_rfc3339()),
        None => println!("no active window"),
    }
    Ok(())
}

/// Serve one page of ranked contacts, running discovery if needed.
async fn handle_discover(
    opportunity: &str,
    keywords: Vec<String>,
    subreddits: Vec<String>,
    page: u32,
    page_size: u32,
    refresh: bool,
) -> anyhow::Result<()> {
    logging::init_cli();
    let (config, db) = open_store().await?;
    let client = build_client(&config, &db)?;

    let scorer: Arc<dyn EngagementScorer> = Arc::new(RecencyKarmaScorer::default());
    let source = Arc::new(RedditCandidateSource::new(
        client,
        scorer,
        config.discovery.clone(),
    ));
    let cache = DiscoveryCache::new(db.clone(), source, config.discovery.clone());

    let profile = OpportunityProfile {
        id: opportunity.to_owned(),
        keywords,
        subreddits,
    };
    if refresh {
        cache.invalidate(&profile.id).await?;
    }
    let served = cache.page(&profile, page, page_size).await?;

    println!(
        "{} contacts (page {} of {})",
        served.total_found, served.page, served.total_pages
    );
    for contact in &served.contacts {
        println!(
            "u/{}  score {:.2}  r/{}",
            contact.handle, contact.engagement_score, contact.subreddit
        );
        println!("    {}", contact.source_excerpt);
        println!("    https://reddit.com{}", contact.permalink);
    }
    Ok(())
}

/// Sweep subreddits and print each post as one JSON line.
///
/// Built for cron: logs go to the production JSON file, posts go to
/// stdout for whatever persistence job consumes them.
async fn handle_sweep(
    subreddits: Vec<String>,
    query: Option<String>,
    limit: u32,
    window: String,
) -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _logging_guard = logging::init_production(Path::new(&config.paths.logs_dir))?;
    let db = store::open(Path::new(&config.paths.db))
        .await
        .with_context(|| format!("failed to open database at {}", config.paths.db))?;
    let client = build_client(&config, &db)?;

    let options = FetchOptions {
        mode: match query {
            Some(q) => FetchMode::Search { query: q },
            None => FetchMode::New,
        },
        limit,
        time_window: window,
    };
    let sweep = client.fetch_multiple_subreddits(&subreddits, &options).await;

    for failure in &sweep.failures {
        warn!(subreddit = %failure.subreddit, error = %failure.error, "subreddit failed");
    }
    info!(
        posts = sweep.posts.len(),
        failed_subreddits = sweep.failures.len(),
        "sweep complete"
    );

    if sweep.posts.is_empty() && !sweep.failures.is_empty() {
        anyhow::bail!("sweep produced nothing: all {} subreddits failed", sweep.failures.len());
    }
    for post in &sweep.posts {
        println!("{}", serde_json::to_string(post)?);
    }
    Ok(())
}

/// Validate and store a user's OAuth token pair.
async fn handle_connect(
    user: &str,
    access_token: &str,
    refresh_token: &str,
    expires_in: i64,
) -> anyhow::Result<()> {
    logging::init_cli();
    let (config, db) = open_store().await?;
    let client = build_client(&config, &db)?;

    // Prove the token works before storing it.
    let identity = client
        .fetch_identity(access_token)
        .await
        .context("token validation against /api/v1/me failed")?;

    let credential = UserCredential {
        user_id: user.to_owned(),
        access_token: access_token.to_owned(),
        refresh_token: refresh_token.to_owned(),
        expires_at: Utc::now().timestamp().saturating_add(expires_in),
    };
    save_user_credential(&db, &credential).await?;

    println!("connected {user} as u/{}", identity.name);
    Ok(())
}
