use std::time::Duration;

use poise::serenity_prelude as serenity;
use tracing::debug;

/// Cycles through the configured "Playing ..." texts.
#[derive(Debug, Clone)]
pub struct ActivityRotation{
  activities: Vec<String>,
  position: usize,
}

impl ActivityRotation{
  pub fn new(activities: Vec<String>) -> Self{
    Self{
      activities,
      position: 0,
    }
  }

  pub fn current(&self) -> Option<&str>{
    self.activities.get(self.position).map(String::as_str)
  }

  pub fn advance(&mut self) -> Option<&str>{
    if self.activities.is_empty(){
      return None;
    }
    self.position = (self.position + 1) % self.activities.len();
    self.current()
  }
}

fn set_playing(ctx: &serenity::Context, name: &str){
  ctx.set_activity(Some(serenity::ActivityData::playing(name)));
}

/// Sets the first activity right away, then rotates every `period` until the process exits.
pub fn spawn_rotation(ctx: serenity::Context, mut rotation: ActivityRotation, period: Duration){
  if let Some(first) = rotation.current(){
    set_playing(&ctx, first);
  }
  tokio::spawn(async move{
    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately
    interval.tick().await;
    loop{
      interval.tick().await;
      if let Some(next) = rotation.advance(){
        debug!(activity = next, "Rotating presence");
        set_playing(&ctx, next);
      }
    }
  });
}
