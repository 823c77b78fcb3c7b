use std::{env, sync::Arc};

use tidelink::{
    Node,
    audio::{SymphoniaOpener, create_client},
    common::{
        logger,
        types::{AnyResult, GuildId, SessionId, UserId},
    },
    configs::Config,
    log_println,
    routeplanner::{BalancingIpRoutePlanner, RoutePlanner},
    sources::{CachingResolver, DirectResolver, ProbeMetadataProvider},
};
use tracing::{error, info, warn};

fn print_build_info() {
    log_println!(
        "tidelink {} ({}@{}, built {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_BRANCH").unwrap_or("unknown"),
        option_env!("GIT_COMMIT").unwrap_or("unknown"),
        option_env!("BUILD_TIME").unwrap_or("unknown"),
    );
}

/// Voice credentials handed over by whatever owns the bot's gateway
/// connection. All four must be present.
fn voice_from_env() -> Option<(GuildId, SessionId, String, String)> {
    Some((
        GuildId::from(env::var("TIDELINK_GUILD_ID").ok()?),
        SessionId::from(env::var("TIDELINK_SESSION_ID").ok()?),
        env::var("TIDELINK_TOKEN").ok()?,
        env::var("TIDELINK_ENDPOINT").ok()?,
    ))
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    print_build_info();
    let config = Config::load()?;
    logger::init(&config);

    let planner: Option<Arc<dyn RoutePlanner>> = if config.route_planner.enabled {
        Some(Arc::new(BalancingIpRoutePlanner::new(&config.route_planner)?))
    } else {
        None
    };
    let resolver = Arc::new(CachingResolver::new(Arc::new(DirectResolver)));
    let opener = Arc::new(SymphoniaOpener::new(
        tokio::runtime::Handle::current(),
        resolver,
        planner,
    )?);
    let metadata = Arc::new(ProbeMetadataProvider::new(create_client(None)?));

    let user_id = env::var("TIDELINK_USER_ID")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(UserId)
        .unwrap_or(UserId(0));
    let (node, mut events) = Node::new(config, user_id, opener, metadata);

    if let Some((guild_id, session_id, token, endpoint)) = voice_from_env() {
        node.voice_server_update(guild_id.clone(), session_id, token, endpoint)?;
        for locator in env::args().skip(1) {
            match node.enqueue_locator(&guild_id, &locator).await {
                Ok(index) => info!("Queued {} at {}", locator, index),
                Err(e) => warn!("Could not queue {}: {}", locator, e),
            }
        }
    } else {
        info!("No voice credentials in the environment, idling");
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!("{}", json),
                    Err(e) => error!("Failed to serialize event: {}", e),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    node.destroy_all();
    Ok(())
}
