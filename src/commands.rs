use crate::{Data, Error};
use poise::serenity_prelude::{GuildId, Member, UserId};
use poise::{Context, command};

fn guild(ctx: Context<'_, Data, Error>) -> Result<GuildId, Error> {
    ctx.guild_id()
        .ok_or_else(|| "This command only works in a server".into())
}

/// Message shown for a member's current escalation state
async fn strikes_summary(data: &Data, guild_id: GuildId, user_id: UserId) -> String {
    match data.engine.strikes(guild_id, user_id).await {
        Some(state) if state.violation_count > 0 => {
            let last = state
                .last_violation_at
                .map_or_else(String::new, |at| format!(", last <t:{}:R>", at.timestamp()));
            format!(
                "<@{user_id}> has {} violation(s) ({}){last}",
                state.violation_count, state.current_tier
            )
        }
        _ => format!("<@{user_id}> has a clean record"),
    }
}

/// Clear a member's violation history
#[command(
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS",
    default_member_permissions = "MODERATE_MEMBERS"
)]
pub async fn pardon(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to pardon"] member: Member,
) -> Result<(), Error> {
    let guild_id = guild(ctx)?;
    let cleared = ctx.data().engine.escalator().clear(guild_id, member.user.id);
    let reply = if cleared {
        format!("Pardoned <@{}>, their record is clean", member.user.id)
    } else {
        format!("<@{}> has no violations to pardon", member.user.id)
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Show a member's violation count and tier
#[command(
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS",
    default_member_permissions = "MODERATE_MEMBERS"
)]
pub async fn strikes(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to look up"] member: Member,
) -> Result<(), Error> {
    let guild_id = guild(ctx)?;
    let reply = strikes_summary(ctx.data(), guild_id, member.user.id).await;
    ctx.say(reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pardon_command_definition() {
        let cmd = pardon();
        assert_eq!(cmd.name, "pardon");
        assert!(cmd.guild_only);
        assert!(
            cmd.required_permissions
                .contains(poise::serenity_prelude::Permissions::MODERATE_MEMBERS)
        );
        assert!(cmd.create_as_slash_command().is_some());
    }

    #[test]
    fn test_strikes_command_definition() {
        let cmd = strikes();
        assert_eq!(cmd.name, "strikes");
        assert!(cmd.guild_only);
        assert!(
            cmd.description
                .unwrap_or_default()
                .contains("violation count")
        );
    }
}
