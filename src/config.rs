use std::{
  path::PathBuf,
  str::FromStr,
  time::Duration,
};

use thiserror::Error;

const DEFAULT_FILEBIN_URL: &str = "https://filebin.net";
const DEFAULT_CONTENT_MARKER: &str = "nglyph";
const DEFAULT_ACTIVITIES: &str = "/help,Having fun,Nya";

#[derive(Error, Debug)]
pub enum ConfigError{
  #[error("Expected {0} in the environment variables")]
  Missing(&'static str),
  #[error("Environment variable {name} has an invalid value: {value}")]
  Invalid{
    name: &'static str,
    value: String,
  },
}

/// Everything the bot needs at startup, read once and handed to each component.
#[derive(Debug, Clone)]
pub struct Config{
  pub token: String,
  pub filebin_url: String,
  pub confirm_timeout: Duration,
  pub content_marker: String,
  pub make_ephemeral: bool,
  pub activities: Vec<String>,
  pub activity_interval: Duration,
  pub log_dir: PathBuf,
  pub work_dir: PathBuf,
  pub ytdlp_bin: String,
  pub ffmpeg_bin: String,
}

impl Config{
  pub fn from_env() -> Result<Self, ConfigError>{
    dotenv::dotenv().ok();
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let token = lookup("BOT_TOKEN")
      .filter(|t| !t.trim().is_empty())
      .ok_or(ConfigError::Missing("BOT_TOKEN"))?;
    let filebin_url = lookup("FILEBIN_URL")
      .unwrap_or_else(|| DEFAULT_FILEBIN_URL.to_string())
      .trim_end_matches('/')
      .to_string();
    let confirm_timeout = Duration::from_secs(parse_or(&lookup, "CONFIRM_TIMEOUT_SECS", 60)?);
    let content_marker = lookup("CONTENT_MARKER")
      .unwrap_or_else(|| DEFAULT_CONTENT_MARKER.to_string())
      .trim_start_matches('.')
      .to_string();
    let make_ephemeral = parse_or(&lookup, "MAKE_EPHEMERAL", false)?;
    let activities = split_activities(&lookup("BOT_ACTIVITIES").unwrap_or_else(|| DEFAULT_ACTIVITIES.to_string()));
    if activities.is_empty(){
      return Err(ConfigError::Invalid{
        name: "BOT_ACTIVITIES",
        value: String::new(),
      });
    }
    let activity_interval = Duration::from_secs(parse_or(&lookup, "ACTIVITY_INTERVAL_SECS", 60)?);

    Ok(Self{
      token,
      filebin_url,
      confirm_timeout,
      content_marker,
      make_ephemeral,
      activities,
      activity_interval,
      log_dir: lookup("LOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
      work_dir: lookup("WORK_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
      ytdlp_bin: lookup("YTDLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
      ffmpeg_bin: lookup("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
    })
  }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
  F: Fn(&str) -> Option<String>,
  T: FromStr,
{
  match lookup(name){
    Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid{ name, value }),
    None => Ok(default),
  }
}

fn split_activities(raw: &str) -> Vec<String>{
  raw.split(',')
    .map(str::trim)
    .filter(|a| !a.is_empty())
    .map(str::to_string)
    .collect()
}

#[cfg(test)]
mod tests{
  use super::*;
  use std::collections::HashMap;

  fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String>{
    let map: HashMap<String, String> = pairs.iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |name| map.get(name).cloned()
  }

  #[test]
  fn defaults_apply_when_only_token_is_set(){
    let config = Config::from_lookup(lookup_from(&[("BOT_TOKEN", "abc")])).unwrap();
    assert_eq!(config.token, "abc");
    assert_eq!(config.filebin_url, "https://filebin.net");
    assert_eq!(config.confirm_timeout, Duration::from_secs(60));
    assert_eq!(config.content_marker, "nglyph");
    assert!(!config.make_ephemeral);
    assert_eq!(config.activities, vec!["/help", "Having fun", "Nya"]);
    assert_eq!(config.ffmpeg_bin, "ffmpeg");
  }

  #[test]
  fn missing_token_is_reported_by_name(){
    let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
    assert!(matches!(err, ConfigError::Missing("BOT_TOKEN")));
  }

  #[test]
  fn invalid_number_names_the_variable(){
    let err = Config::from_lookup(lookup_from(&[
      ("BOT_TOKEN", "abc"),
      ("CONFIRM_TIMEOUT_SECS", "soon"),
    ])).unwrap_err();
    match err{
      ConfigError::Invalid{ name, value } => {
        assert_eq!(name, "CONFIRM_TIMEOUT_SECS");
        assert_eq!(value, "soon");
      },
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn overrides_are_normalized(){
    let config = Config::from_lookup(lookup_from(&[
      ("BOT_TOKEN", "abc"),
      ("FILEBIN_URL", "http://localhost:8080/"),
      ("CONTENT_MARKER", ".glyph"),
      ("MAKE_EPHEMERAL", "true"),
      ("BOT_ACTIVITIES", " one , ,two "),
    ])).unwrap();
    assert_eq!(config.filebin_url, "http://localhost:8080");
    assert_eq!(config.content_marker, "glyph");
    assert!(config.make_ephemeral);
    assert_eq!(config.activities, vec!["one", "two"]);
  }

  #[test]
  fn empty_activity_list_is_rejected(){
    let err = Config::from_lookup(lookup_from(&[
      ("BOT_TOKEN", "abc"),
      ("BOT_ACTIVITIES", " , "),
    ])).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid{ name: "BOT_ACTIVITIES", .. }));
  }
}
