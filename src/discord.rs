use std::sync::Arc;

use dashmap::DashMap;
use poise::serenity_prelude as serenity;
use tracing::{error, info, warn};

use crate::{
  config::Config,
  media::{validate_url, MediaTools},
  presence::{spawn_rotation, ActivityRotation},
  session::{
    SessionState, UploadMetadata, UploadSession, UploadWorkflow
  },
  storage::{FilebinClient, StorageError},
};

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;
type CommandResult = Result<(), Error>;

const CONFIRM_PREFIX: &str = "filebin-confirm:";
const NOT_DONE: &str = "Not done yet...";

const ABOUT_TEXT: &str = "This discord bot is an easy interface for the Custom Glyph tools. It uses the scripts created by <@429776328833761280> to create and visualize custom glyphs. You can find the source code for the tools at the following links:";
const HELP_TEXT: &str = "This bot provides an easy interface for the Custom Glyph tools. You can use the following commands to create and visualize custom glyphs:";
const HELP_ENTRIES: &[(&str, &str)] = &[
  ("/ping", "Check if the bot is online."),
  ("/about", "Display information about the bot."),
  ("/create", "Create a custom glyph."),
  ("/dl_trim", "Download and trim the audio of a song."),
  ("/upload", "Publish a custom glyph to our database."),
  ("/search", "Search for a custom glyph."),
  ("/help", "Display this help message."),
];

pub struct Data {
  config: Arc<Config>,
  workflow: UploadWorkflow<FilebinClient>,
  sessions: Arc<DashMap<String, Arc<UploadSession>>>,
  media: MediaTools,
}

fn reply(ctx: Context<'_>, content: impl Into<String>) -> poise::CreateReply{
  poise::CreateReply::default()
    .content(content)
    .ephemeral(ctx.data().config.make_ephemeral)
}

fn private_reply(content: impl Into<String>) -> poise::CreateReply{
  poise::CreateReply::default()
    .content(content)
    .ephemeral(true)
}

/// Check if the bot is online
#[poise::command(slash_command, prefix_command)]
async fn ping(ctx: Context<'_>) -> CommandResult {
  let latency = ctx.ping().await;
  ctx.send(reply(ctx, format!("Pong! {}ms", latency.as_millis()))).await?;
  Ok(())
}

/// Display information about the bot
#[poise::command(slash_command, prefix_command)]
async fn about(ctx: Context<'_>) -> CommandResult {
  let embed = serenity::CreateEmbed::new()
    .title("About the bot")
    .description(ABOUT_TEXT)
    .footer(serenity::CreateEmbedFooter::new("Click a button to navigate to the according Github Repo."));
  let row = serenity::CreateActionRow::Buttons(vec![
    serenity::CreateButton::new_link("https://github.com/SebiAi/custom-nothing-glyph-tools")
      .label("SebiAi/custom-nothing-glyph-tools")
      .emoji('🔧'),
    serenity::CreateButton::new_link("https://github.com/SebiAi/GlyphVisualizer")
      .label("SebiAi/GlyphVisualizer")
      .emoji('🔍'),
  ]);
  ctx.send(poise::CreateReply::default()
    .embed(embed)
    .components(vec![row])
    .ephemeral(ctx.data().config.make_ephemeral)
  ).await?;
  Ok(())
}

/// Display the help message
#[poise::command(slash_command, prefix_command)]
async fn help(ctx: Context<'_>) -> CommandResult {
  let embed = HELP_ENTRIES.iter().fold(
    serenity::CreateEmbed::new().title("Help").description(HELP_TEXT),
    |embed, (name, value)| embed.field(*name, *value, false)
  );
  ctx.send(poise::CreateReply::default()
    .embed(embed)
    .ephemeral(ctx.data().config.make_ephemeral)
  ).await?;
  Ok(())
}

/// Download the audio of a URL and trim it to a time range
#[poise::command(slash_command, prefix_command)]
async fn dl_trim(
  ctx: Context<'_>,
  #[rename = "audio_url"]
  #[description = "The audio file URL"] url: String,
  #[rename = "start_time"]
  #[description = "The time to start the clip at, in seconds"] begin: Option<f64>,
  #[rename = "end_time"]
  #[description = "The time to stop the clip at, in seconds"] end: Option<f64>,
) -> CommandResult {
  ctx.defer().await?;

  let clip = match ctx.data().media.fetch_clip(&url, begin.unwrap_or(0.0), end).await{
    Ok(r) => r,
    Err(err) => {
      warn!(url = %url, error = %err, "dl_trim failed");
      ctx.send(private_reply(err.user_message())).await?;
      return Ok(());
    }
  };
  // clip files are removed when `clip` drops, whether or not sending worked
  let attachment = serenity::CreateAttachment::path(&clip.trimmed).await?;
  ctx.send(poise::CreateReply::default()
    .content("Here's your audio! Enjoy! 🎵")
    .attachment(attachment)
  ).await?;
  Ok(())
}

fn editable_message(session_id: &str, fetched: serenity::Result<serenity::Message>) -> Option<serenity::Message>{
  match fetched{
    Ok(message) => Some(message),
    Err(err) => {
      warn!(session = %session_id, error = %err, "Unable to fetch upload message, its buttons will stay enabled");
      None
    }
  }
}

fn upload_buttons(session_id: &str, upload_url: &str, disabled: bool) -> Vec<serenity::CreateActionRow>{
  vec![serenity::CreateActionRow::Buttons(vec![
    serenity::CreateButton::new_link(upload_url)
      .label("Upload")
      .emoji('📤')
      .disabled(disabled),
    serenity::CreateButton::new(format!("{CONFIRM_PREFIX}{session_id}"))
      .label("Confirm")
      .style(serenity::ButtonStyle::Success)
      .disabled(disabled),
  ])]
}

fn upload_embed(session: &UploadSession, marker: &str, requester: &str) -> serenity::CreateEmbed{
  let metadata = session.metadata();
  let trim = match metadata.trim_end{
    Some(end) => format!("{}s - {}s", metadata.trim_begin, end),
    None => format!("{}s - end", metadata.trim_begin),
  };
  let mut embed = serenity::CreateEmbed::new()
    .title(format!("Create \"{}\"", metadata.title))
    .description(format!(
      "Upload your `.{marker}` file to the bin with the **Upload** button, then press **Confirm** within {} seconds.",
      session.token().remaining().as_secs()
    ))
    .field("Song", metadata.source_url.as_str(), false)
    .field("Trim", trim, true);
  if !metadata.watermark.is_empty(){
    embed = embed.field("Watermark", metadata.watermark.as_str(), true);
  }
  embed.footer(serenity::CreateEmbedFooter::new(format!("Only {requester} can confirm this upload.")))
}

/// Create a custom glyph
#[poise::command(slash_command, prefix_command)]
async fn create(
  ctx: Context<'_>,
  #[description = "The name of the custom glyph"] name: String,
  #[description = "URL of the song the glyph is made for"] source_url: String,
  #[description = "Where the song starts, in seconds"] start_time: Option<f64>,
  #[description = "Where the song ends, in seconds"] end_time: Option<f64>,
  #[description = "Text to watermark the glyph with"] watermark: Option<String>,
) -> CommandResult {
  let data = ctx.data();
  if let Err(err) = validate_url(&source_url){
    ctx.send(private_reply(err.user_message())).await?;
    return Ok(());
  }
  let begin = start_time.unwrap_or(0.0);
  if !(begin >= 0.0) || end_time.is_some_and(|end| !(end >= begin)){
    ctx.send(private_reply("Invalid begin or end time.")).await?;
    return Ok(());
  }
  // reserving the bin is a round trip to the bin service
  ctx.defer().await?;

  let metadata = UploadMetadata{
    title: name,
    source_url,
    trim_begin: begin,
    trim_end: end_time,
    watermark: watermark.unwrap_or_default(),
  };
  let session = match data.workflow.start_session(metadata, ctx.author().id.get()).await{
    Ok(r) => r,
    Err(err) => {
      ctx.send(private_reply(err.user_message())).await?;
      return Ok(());
    }
  };
  data.sessions.insert(session.id().to_string(), Arc::clone(&session));

  // the reply has to stay editable so the buttons can be switched off later
  let sent = ctx.send(poise::CreateReply::default()
    .embed(upload_embed(&session, data.workflow.marker(), &ctx.author().name))
    .components(upload_buttons(session.id(), session.upload_url(), false))
  ).await;
  let (message, send_error) = match sent{
    Ok(handle) => (editable_message(session.id(), handle.into_message().await), None),
    Err(err) => (None, Some(err)),
  };

  let sessions = Arc::clone(&data.sessions);
  let http = ctx.serenity_context().http.clone();
  let session_id = session.id().to_string();
  let upload_url = session.upload_url().to_string();
  data.workflow.arm_expiry(Arc::clone(&session), move |expired| async move{
    sessions.remove(&session_id);
    let Some(mut message) = message else{
      return;
    };
    let mut edit = serenity::EditMessage::new()
      .components(upload_buttons(&session_id, &upload_url, true));
    if expired{
      edit = edit.content("This upload window has expired.");
    }
    if let Err(err) = message.edit(&*http, edit).await{
      warn!(session = %session_id, error = %err, "Unable to disable upload buttons");
    }
  });

  match send_error{
    Some(err) => Err(err.into()),
    None => Ok(()),
  }
}

/// Publish a custom glyph
#[poise::command(slash_command, prefix_command)]
async fn upload(ctx: Context<'_>) -> CommandResult {
  ctx.send(reply(ctx, NOT_DONE)).await?;
  Ok(())
}

/// Search for a custom glyph
#[poise::command(slash_command, prefix_command)]
async fn search(
  ctx: Context<'_>,
  #[rename = "query"]
  #[description = "What to search for"] _query: Option<String>,
) -> CommandResult {
  ctx.send(reply(ctx, NOT_DONE)).await?;
  Ok(())
}

async fn handle_confirm(
  ctx: &serenity::Context,
  component: &serenity::ComponentInteraction,
  session_id: &str,
  data: &Data,
) -> Result<(), Error>{
  let session = data.sessions.get(session_id).map(|entry| Arc::clone(entry.value()));
  let Some(session) = session else{
    component.create_response(ctx, serenity::CreateInteractionResponse::Message(
      serenity::CreateInteractionResponseMessage::new()
        .content("This upload window is no longer active.")
        .ephemeral(true)
    )).await?;
    return Ok(());
  };

  component.create_response(ctx, serenity::CreateInteractionResponse::Defer(
    serenity::CreateInteractionResponseMessage::new().ephemeral(true)
  )).await?;

  let content = match data.workflow.confirm(&session, component.user.id.get()).await{
    Ok(file) => format!(
      "Received `{}` ({} bytes) for **{}**. Glyph processing is not done yet, stay tuned!",
      file.filename,
      file.content.len(),
      session.metadata().title
    ),
    Err(err) => {
      info!(session = %session.id(), user = %component.user.name, error = %err, "Confirmation rejected");
      err.user_message()
    }
  };
  component.create_followup(ctx, serenity::CreateInteractionResponseFollowup::new()
    .content(content)
    .ephemeral(true)
  ).await?;

  if session.state() == SessionState::Closed{
    data.sessions.remove(session.id());
    let mut message = (*component.message).clone();
    let edit = serenity::EditMessage::new()
      .components(upload_buttons(session.id(), session.upload_url(), true));
    if let Err(err) = message.edit(ctx, edit).await{
      warn!(session = %session.id(), error = %err, "Unable to disable upload buttons");
    }
  }
  Ok(())
}

async fn poise_event_handler(
  ctx: &serenity::Context,
  event: &serenity::FullEvent,
  _framework: poise::FrameworkContext<'_, Data, Error>,
  data: &Data,
) -> Result<(), Error>{
  match event {
    serenity::FullEvent::InteractionCreate{interaction} => {
      let Some(component) = interaction.as_message_component() else{
        return Ok(());
      };
      if let Some(session_id) = component.data.custom_id.strip_prefix(CONFIRM_PREFIX){
        handle_confirm(ctx, component, session_id, data).await?;
      }
    },
    _ => {}
  }
  Ok(())
}

async fn on_error(error: poise::FrameworkError<'_, Data, Error>){
  match error{
    poise::FrameworkError::Command{ error, ctx, .. } => {
      error!("Command {} failed with error: {}", ctx.command().qualified_name, error);
      check_msg(ctx.send(private_reply("Something went wrong while running that command.")).await);
    },
    poise::FrameworkError::EventHandler{ error, .. } => {
      error!("Event handler failed with error: {}", error);
    },
    other => {
      if let Err(err) = poise::builtins::on_error(other).await{
        error!("Error while handling error: {}", err);
      }
    },
  }
}

fn get_framework_options() -> poise::FrameworkOptions<Data, Error>{
  poise::FrameworkOptions{
    commands: vec![ping(), about(), help(), dl_trim(), create(), upload(), search()],
    prefix_options: poise::PrefixFrameworkOptions{
      prefix: Some("~".to_string()),
      ..Default::default()
    },
    pre_command: |ctx| {
      Box::pin(async move {
        let guild = ctx.guild_id()
          .map(|id| id.to_string())
          .unwrap_or_else(|| "DM".to_string());
        info!(
          "{} used /{} command in {} on {}.",
          ctx.author().name,
          ctx.command().qualified_name,
          ctx.channel_id(),
          guild
        );
      })
    },
    event_handler: |ctx, event, framework, data|{
      Box::pin(poise_event_handler(ctx, event, framework, data))
    },
    on_error: |error| Box::pin(on_error(error)),
    ..Default::default()
  }
}

pub fn get_framework(config: Config) -> Result<poise::Framework<Data, Error>, StorageError>{
  let config = Arc::new(config);
  let storage = Arc::new(FilebinClient::new(&config.filebin_url)?);
  let workflow = UploadWorkflow::new(storage, config.confirm_timeout, config.content_marker.clone());
  let media = MediaTools::new(&config);
  Ok(poise::Framework::builder()
    .options(get_framework_options())
    .setup(move |ctx, ready, framework|{
        Box::pin(async move{
            info!("Logged in as {}", ready.user.name);
            info!("ID: {}", ready.user.id);
            poise::builtins::register_globally(ctx, &framework.options().commands).await?;
            spawn_rotation(
              ctx.clone(),
              ActivityRotation::new(config.activities.clone()),
              config.activity_interval
            );
            Ok(Data {
              config,
              workflow,
              sessions: Arc::new(DashMap::new()),
              media,
            })
        })
    })
    .build())
}

fn check_msg<T>(result: serenity::Result<T>){
  if let Err(why) = result {
    warn!("Error sending message {why:?}");
  }
}

#[cfg(test)]
mod tests{
  use super::*;

  #[test]
  fn unfetchable_upload_message_is_dropped(){
    let fetched = Err(serenity::Error::Other("unknown message"));
    assert!(editable_message("abc", fetched).is_none());
  }

  #[test]
  fn confirm_button_carries_session_id(){
    let rows = upload_buttons("abc123", "https://filebin.example/bin", false);
    let json = serde_json::to_string(&rows).unwrap();
    assert!(json.contains("filebin-confirm:abc123"));
    assert!(json.contains("https://filebin.example/bin"));
  }
}
