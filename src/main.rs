pub mod config;
pub mod discord;
pub mod logging;
pub mod media;
pub mod presence;
pub mod session;
pub mod storage;

use poise::serenity_prelude as serenity;
use serenity::GatewayIntents;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>>{
    let config = config::Config::from_env()?;
    let log_path = logging::init(&config.log_dir)?;
    info!("Logging to {}", log_path.display());

    let token = config.token.clone();
    let framework = discord::get_framework(config)?;

    let client_task = tokio::spawn(async move {
        let intents = GatewayIntents::non_privileged()
            | GatewayIntents::GUILD_MEMBERS
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = match serenity::ClientBuilder::new(&token, intents)
            .framework(framework)
            .await{
                Ok(r) => r,
                Err(err) => {
                    error!("Error creating client: {err:?}");
                    return;
                }
            };

        if let Err(why) = client.start_autosharded().await {
            error!("Client error: {why:?}");
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = client_task => error!("Discord client stopped"),
    }
    info!("Program exited gracefully");
    Ok(())
}
