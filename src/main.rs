//! fedbridge-admin - operator tool for the bridge's identity store

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use fedbridge::{
    cache::MemorySharedCache,
    config::Args,
    db::{schemas::UserKey, MongoStore},
    logging,
    notify::ChannelNotifier,
    protocol::{ConfiguredProtocol, ProtocolRegistry},
    services::{FollowCollection, PageParams},
    Bridge, BridgeConfig,
};

#[derive(Parser, Debug)]
#[command(name = "fedbridge-admin", about = "Inspect and maintain bridged users and objects")]
struct Cli {
    #[command(flatten)]
    args: Args,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the document store's indexes
    EnsureIndexes,

    /// Resolve a copy id to the original object or user it stands for
    Resolve { copy_id: String },

    /// List a user's followers, or who they follow
    Followers {
        protocol: String,
        id: String,

        #[arg(long)]
        following: bool,

        #[arg(long, conflicts_with = "after")]
        before: Option<String>,

        #[arg(long)]
        after: Option<String>,
    },

    /// Show a user's follower and following counts
    Counts { protocol: String, id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    logging::init_tracing(&cli.args.log_level, cli.args.log_json);

    if let Err(e) = cli.args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = BridgeConfig::from_args(&cli.args);
    let protocols = ConfiguredProtocol::load_file(&cli.args.protocols_file)?;
    let mut builder = ProtocolRegistry::builder()
        .bridge_domain(config.bridge_domain.as_str())
        .old_account_age(config.old_account_age)
        .allow_synthetic(config.allow_synthetic);
    for protocol in protocols {
        builder = builder.register(protocol);
    }
    let registry = Arc::new(builder.build()?);
    info!("Loaded {} protocols", registry.all().count());

    let mongo = MongoStore::new(&cli.args.mongodb_uri, &cli.args.mongodb_db).await?;
    info!("MongoDB connected: {}", mongo.db_name());

    if let Command::EnsureIndexes = cli.command {
        mongo.ensure_indexes().await?;
        info!("Indexes ensured");
        return Ok(());
    }

    let (notifier, _dms) = ChannelNotifier::new();
    let bridge = Bridge::new(
        Arc::new(mongo),
        registry,
        Arc::new(MemorySharedCache::new()),
        Arc::new(notifier),
        config,
    );

    match cli.command {
        Command::EnsureIndexes => {}

        Command::Resolve { copy_id } => {
            let originals = bridge.originals();
            if let Some(id) = originals.original_object(bridge.store(), &copy_id).await? {
                println!("object {}", id);
            } else if let Some(user) = originals
                .original_user(bridge.store(), bridge.registry(), &copy_id)
                .await?
            {
                println!("user {}", user);
            } else {
                println!("{} isn't a known copy", copy_id);
            }
        }

        Command::Followers {
            protocol,
            id,
            following,
            before,
            after,
        } => {
            let user = user_key(&bridge, &protocol, &id)?;
            let collection = if following {
                FollowCollection::Following
            } else {
                FollowCollection::Followers
            };
            let page = bridge
                .fetch_followers_page(collection, &user, &PageParams { before, after })
                .await?;

            for follower in &page.items {
                let name = follower
                    .user
                    .as_ref()
                    .map(|user| bridge.name(user))
                    .unwrap_or_default();
                let other = match collection {
                    FollowCollection::Followers => &follower.from,
                    FollowCollection::Following => &follower.to,
                };
                println!(
                    "{}  {}  {}",
                    follower.metadata.updated.to_rfc3339(),
                    other,
                    name
                );
            }
            if let Some(before) = &page.before {
                println!("older: --before {}", before);
            }
            if let Some(after) = &page.after {
                println!("newer: --after {}", after);
            }
        }

        Command::Counts { protocol, id } => {
            let user = user_key(&bridge, &protocol, &id)?;
            let (followers, following) = bridge.count_followers(&user).await?;
            println!("{} followers, {} following", followers, following);
        }
    }

    Ok(())
}

/// Key for a user, with the protocol's primary label
fn user_key(bridge: &Bridge, protocol: &str, id: &str) -> anyhow::Result<UserKey> {
    let proto = bridge
        .registry()
        .lookup(protocol)
        .ok_or_else(|| anyhow::anyhow!("Unknown protocol {}", protocol))?;
    Ok(UserKey::new(proto.label(), proto.normalize_user_id(id)))
}
