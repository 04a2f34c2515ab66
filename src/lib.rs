pub mod commands;
pub mod config;
pub mod data;
pub mod handlers;
pub mod logging;
pub mod maintenance;
pub mod moderation;

pub const BOT_NAME: &str = "guild_censor";
pub const COMMAND_TARGET: &str = "guild_censor::command";
pub const ERROR_TARGET: &str = "guild_censor::error";
pub const EVENT_TARGET: &str = "guild_censor::handlers";
pub const MODERATION_TARGET: &str = "guild_censor::moderation";
pub const CONSOLE_TARGET: &str = "guild_censor";

pub use config::EngineConfig;
pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
