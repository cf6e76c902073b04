//! Relocation stage: move an archived channel into the archive category.
//!
//! The channel is renamed first when its name collides with a channel
//! already in the category, then re-parented. Members are told the outcome
//! through a notice in the channel itself.

use tracing::info;

use crate::chat::{notify_best_effort, ChatPlatform, Notice, CATEGORY_KIND};
use crate::error::{StageError, StageResult};
use crate::namer::resolve_unique_channel_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub final_name: String,
    pub renamed: bool,
}

pub async fn relocate_channel(
    chat: &dyn ChatPlatform,
    channel_id: &str,
    guild_id: &str,
    category_id: &str,
    site_url: Option<&str>,
) -> StageResult<Relocation> {
    let channel = chat.channel(channel_id).await?;
    let guild_channels = chat.guild_channels(guild_id).await?;

    let category_exists = guild_channels
        .iter()
        .any(|c| c.id == category_id && c.kind == CATEGORY_KIND);
    if !category_exists {
        let detail = format!("archive category not found: {}", category_id);
        notify_best_effort(chat, channel_id, &Notice::new("Channel Archival Failed", &detail))
            .await;
        return Err(StageError::Data(detail));
    }

    let siblings: Vec<&str> = guild_channels
        .iter()
        .filter(|c| c.parent_id.as_deref() == Some(category_id) && c.id != channel.id)
        .map(|c| c.name.as_str())
        .collect();
    let final_name = resolve_unique_channel_name(&channel.name, &siblings);
    let renamed = final_name != channel.name;

    info!(
        channel = %channel.name,
        target = %final_name,
        renamed,
        "moving channel into archive category"
    );

    let moved = async {
        if renamed {
            chat.rename_channel(channel_id, &final_name).await?;
        }
        chat.move_channel(channel_id, category_id).await
    }
    .await;

    let backup = site_url
        .map(|url| format!(" A backup has been created and can be accessed here: {}", url))
        .unwrap_or_default();

    if let Err(e) = moved {
        let notice = Notice::new(
            "Channel Exported, but Not Moved to Archive",
            format!(
                "This channel could not be moved to the archive due to an error: {}.{}",
                e, backup
            ),
        );
        notify_best_effort(chat, channel_id, &notice).await;
        return Err(e);
    }

    let rename_note = if renamed {
        format!(" and renamed to {} to avoid naming conflicts", final_name)
    } else {
        String::new()
    };
    let notice = Notice::new(
        "Channel Moved to Archive",
        format!(
            "This channel has been moved to the archive{}!{}",
            rename_note, backup
        ),
    );
    notify_best_effort(chat, channel_id, &notice).await;

    Ok(Relocation {
        final_name,
        renamed,
    })
}
