use std::env;
use std::sync::Arc;

use guild_censor::config::CONFIG_FILE;
use guild_censor::maintenance::{self, MaintenanceSettings};
use guild_censor::moderation::{
    ActionHandlerRegistry, AuditLogger, CacheSnapshotProvider, Classifiers, DiscordAuditSink,
    ModerationEngine, PatternFilter, PermissionGuard, PolicyStore, SignalAggregator,
};
use guild_censor::{BOT_NAME, Data, EngineConfig, Error, commands, handlers, logging};
use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use tracing::{error, info};

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let token = env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN must be set")?;

    let config = EngineConfig::load(CONFIG_FILE).await?;
    let policies = PolicyStore::new(&config.policy_dir);
    policies.load().await?;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![commands::pardon(), commands::strikes()],
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    logging::log_command_error(&error);
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                let http = Arc::clone(&ctx.http);
                let snapshots = CacheSnapshotProvider::new(Arc::clone(&ctx.cache), ready.user.id);

                let signals = SignalAggregator::new(
                    PatternFilter::new(config.repeat_threshold),
                    Classifiers::default(),
                    config.signal_settings(),
                );
                let audit = AuditLogger::start(
                    Arc::new(DiscordAuditSink::new(Arc::clone(&http))),
                    config.audit_queue_capacity,
                );
                let engine = Arc::new(ModerationEngine::new(
                    Arc::new(policies.clone()),
                    signals,
                    PermissionGuard::new(Arc::new(snapshots)),
                    Arc::new(ActionHandlerRegistry::new(http)),
                    audit,
                    config.bucket_window(),
                ));

                let (maintenance_tx, _) = maintenance::start(
                    Arc::clone(&engine),
                    policies.clone(),
                    MaintenanceSettings {
                        interval: config.janitor_interval(),
                        escalation_idle: config.escalation_idle(),
                    },
                );
                let data = Data::new(config, policies, engine).with_maintenance(maintenance_tx);

                // The gateway handler reads the engine from serenity's data map
                ctx.data.write().await.insert::<Data>(data.clone());

                logging::log_console(format!("Registering commands for {BOT_NAME}"));
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(data)
            })
        })
        .build();

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MESSAGE_REACTIONS;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .event_handler(handlers::Handler)
        .framework(framework)
        .await?;

    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(err) = client.start().await {
        error!("Error running the bot: {err}");
    }

    let data = client.data.read().await.get::<Data>().cloned();
    if let Some(data) = data {
        data.shutdown().await;
    }

    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to build runtime: {err}");
            return;
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
    }
}
