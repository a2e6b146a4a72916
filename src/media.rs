use std::{
  ffi::OsString,
  path::{Path, PathBuf},
  process::Output,
};

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;

const STDERR_LIMIT: usize = 240;

#[derive(Error, Debug)]
pub enum MediaError{
  #[error("Invalid URL: {0}")]
  InvalidUrl(String),
  #[error("Invalid trim range {begin}..{end:?}")]
  InvalidTrim{
    begin: f64,
    end: Option<f64>,
  },
  #[error("yt-dlp could not extract info: {0}")]
  Extraction(String),
  #[error("yt-dlp download failed: {0}")]
  Download(String),
  #[error("ffmpeg failed: {0}")]
  Transcode(String),
  #[error("Could not run media tool: {0}")]
  Io(#[from] std::io::Error),
}

impl MediaError{
  pub fn user_message(&self) -> String{
    match self{
      MediaError::InvalidUrl(_) => "Invalid URL provided.".to_string(),
      MediaError::InvalidTrim{ .. } => "Invalid begin or end time.".to_string(),
      MediaError::Extraction(_) => "Error extracting info from the URL.".to_string(),
      MediaError::Download(reason) => format!("Error downloading the audio file: {reason}"),
      MediaError::Transcode(reason) => format!("Error trimming the audio file: {reason}"),
      MediaError::Io(_) => "The audio tools are not available right now.".to_string(),
    }
  }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MediaInfo{
  pub title: String,
  pub duration: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimRange{
  pub begin: f64,
  pub end: f64,
}

impl TrimRange{
  /// `end` defaults to the full duration. Both bounds must fall inside the media.
  pub fn new(begin: f64, end: Option<f64>, duration: f64) -> Result<Self, MediaError>{
    let stop = end.unwrap_or(duration);
    let valid = begin >= 0.0 && stop >= 0.0 && begin <= stop && stop <= duration;
    if !valid{
      return Err(MediaError::InvalidTrim{ begin, end });
    }
    Ok(Self{ begin, end: stop })
  }

  pub fn length(&self) -> f64{
    self.end - self.begin
  }
}

pub fn validate_url(raw: &str) -> Result<Url, MediaError>{
  let url = Url::parse(raw.trim()).map_err(|_| MediaError::InvalidUrl(raw.to_string()))?;
  if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none(){
    return Err(MediaError::InvalidUrl(raw.to_string()));
  }
  Ok(url)
}

/// Filesystem-safe stem: the title's safe characters plus a random suffix.
pub fn clip_stem(title: &str) -> String{
  let mut safe: String = title.chars()
    .map(|c| if c.is_whitespace(){ '_' }else{ c })
    .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
    .take(64)
    .collect();
  if safe.is_empty(){
    safe.push_str("clip");
  }
  format!("{safe}_{}", uuid::Uuid::new_v4())
}

/// The downloaded and trimmed files of one clip. Both are removed on drop.
#[derive(Debug)]
pub struct ClipFiles{
  pub source: PathBuf,
  pub trimmed: PathBuf,
}

impl ClipFiles{
  pub fn new(dir: &Path, stem: &str) -> Self{
    Self{
      source: dir.join(format!("{stem}.opus")),
      trimmed: dir.join(format!("{stem}.ogg")),
    }
  }

  fn output_template(&self) -> PathBuf{
    self.source.with_extension("%(ext)s")
  }
}

impl Drop for ClipFiles{
  fn drop(&mut self){
    for path in [&self.source, &self.trimmed]{
      if path.is_file(){
        if let Err(err) = std::fs::remove_file(path){
          warn!(path = %path.display(), error = %err, "Unable to remove clip file");
        }
      }
    }
  }
}

fn ffmpeg_args(files: &ClipFiles, range: TrimRange) -> Vec<OsString>{
  vec![
    "-i".into(),
    files.source.clone().into_os_string(),
    "-ab".into(),
    "189k".into(),
    "-ss".into(),
    range.begin.to_string().into(),
    "-t".into(),
    range.length().to_string().into(),
    "-acodec".into(),
    "libopus".into(),
    files.trimmed.clone().into_os_string(),
  ]
}

fn stderr_tail(output: &Output) -> String{
  let text = String::from_utf8_lossy(&output.stderr);
  let text = text.trim();
  let skip = text.chars().count().saturating_sub(STDERR_LIMIT);
  text.chars().skip(skip).collect()
}

pub struct MediaTools{
  ytdlp_bin: String,
  ffmpeg_bin: String,
  work_dir: PathBuf,
}

impl MediaTools{
  pub fn new(config: &Config) -> Self{
    Self{
      ytdlp_bin: config.ytdlp_bin.clone(),
      ffmpeg_bin: config.ffmpeg_bin.clone(),
      work_dir: config.work_dir.clone(),
    }
  }

  pub async fn fetch_info(&self, url: &Url) -> Result<MediaInfo, MediaError>{
    let output = Command::new(&self.ytdlp_bin)
      .args(["--dump-single-json", "--no-playlist", "--no-warnings"])
      .arg(url.as_str())
      .output()
      .await?;
    if !output.status.success(){
      return Err(MediaError::Extraction(stderr_tail(&output)));
    }
    serde_json::from_slice(&output.stdout).map_err(|err| MediaError::Extraction(err.to_string()))
  }

  async fn download_audio(&self, url: &Url, files: &ClipFiles) -> Result<(), MediaError>{
    let output = Command::new(&self.ytdlp_bin)
      .args([
        "-f", "bestaudio/best",
        "-x", "--audio-format", "opus", "--audio-quality", "192K",
        "--restrict-filenames", "--no-playlist", "--no-overwrites",
        "--quiet", "--no-warnings",
        "-o",
      ])
      .arg(files.output_template())
      .arg(url.as_str())
      .output()
      .await?;
    if !output.status.success(){
      return Err(MediaError::Download(stderr_tail(&output)));
    }
    if !files.source.is_file(){
      return Err(MediaError::Download("no audio file was produced".to_string()));
    }
    Ok(())
  }

  async fn trim(&self, files: &ClipFiles, range: TrimRange) -> Result<(), MediaError>{
    let output = Command::new(&self.ffmpeg_bin)
      .args(ffmpeg_args(files, range))
      .output()
      .await?;
    if !output.status.success(){
      return Err(MediaError::Transcode(stderr_tail(&output)));
    }
    Ok(())
  }

  /// Downloads the best audio of `url` and cuts it to `begin..end` seconds.
  pub async fn fetch_clip(&self, url: &str, begin: f64, end: Option<f64>) -> Result<ClipFiles, MediaError>{
    let url = validate_url(url)?;
    let info = self.fetch_info(&url).await?;
    let duration = info.duration
      .ok_or_else(|| MediaError::Extraction("media has no known duration".to_string()))?;
    let range = TrimRange::new(begin, end, duration)?;

    let files = ClipFiles::new(&self.work_dir, &clip_stem(&info.title));
    debug!(title = %info.title, begin = range.begin, end = range.end, "Downloading clip");
    self.download_audio(&url, &files).await?;
    self.trim(&files, range).await?;
    Ok(files)
  }
}

#[cfg(test)]
mod tests{
  use super::*;

  #[test]
  fn urls_need_http_scheme_and_host(){
    assert!(validate_url("https://www.youtube.com/watch?v=abc").is_ok());
    assert!(validate_url("  http://example.com/a.mp3 ").is_ok());
    assert!(matches!(validate_url("ftp://example.com/a.mp3"), Err(MediaError::InvalidUrl(_))));
    assert!(matches!(validate_url("not a url"), Err(MediaError::InvalidUrl(_))));
  }

  #[test]
  fn trim_end_defaults_to_duration(){
    let range = TrimRange::new(5.0, None, 30.0).unwrap();
    assert_eq!(range, TrimRange{ begin: 5.0, end: 30.0 });
    assert_eq!(range.length(), 25.0);
  }

  #[test]
  fn trim_rejects_out_of_bounds(){
    assert!(TrimRange::new(-1.0, Some(10.0), 30.0).is_err());
    assert!(TrimRange::new(10.0, Some(5.0), 30.0).is_err());
    assert!(TrimRange::new(0.0, Some(31.0), 30.0).is_err());
    assert!(TrimRange::new(f64::NAN, None, 30.0).is_err());
    assert!(TrimRange::new(30.0, Some(30.0), 30.0).is_ok());
  }

  #[test]
  fn stems_are_safe_and_unique(){
    let first = clip_stem("My Song: Live/Remix");
    assert!(first.starts_with("My_Song_LiveRemix_"));
    assert_ne!(first, clip_stem("My Song: Live/Remix"));
    assert!(clip_stem("???").starts_with("clip_"));
  }

  #[test]
  fn ffmpeg_gets_offset_and_duration(){
    let files = ClipFiles::new(Path::new("/tmp/work"), "song_1");
    let args: Vec<String> = ffmpeg_args(&files, TrimRange{ begin: 2.5, end: 12.5 })
      .into_iter()
      .map(|a| a.to_string_lossy().into_owned())
      .collect();
    assert_eq!(args, vec![
      "-i", "/tmp/work/song_1.opus",
      "-ab", "189k",
      "-ss", "2.5",
      "-t", "10",
      "-acodec", "libopus",
      "/tmp/work/song_1.ogg",
    ]);
    assert_eq!(files.output_template(), PathBuf::from("/tmp/work/song_1.%(ext)s"));
  }

  #[test]
  fn clip_files_are_removed_on_drop(){
    let dir = std::env::temp_dir();
    let files = ClipFiles::new(&dir, &clip_stem("drop test"));
    std::fs::write(&files.source, b"opus").unwrap();
    std::fs::write(&files.trimmed, b"ogg").unwrap();
    let (source, trimmed) = (files.source.clone(), files.trimmed.clone());
    drop(files);
    assert!(!source.exists());
    assert!(!trimmed.exists());
  }

  #[test]
  fn yt_dlp_info_parses(){
    let info: MediaInfo = serde_json::from_str(r#"{"title": "Song", "duration": 212.0, "id": "x"}"#).unwrap();
    assert_eq!(info, MediaInfo{ title: "Song".to_string(), duration: Some(212.0) });
  }

  #[test]
  fn user_messages_hide_details_where_needed(){
    assert_eq!(MediaError::InvalidUrl("x".into()).user_message(), "Invalid URL provided.");
    assert_eq!(
      MediaError::Transcode("bad codec".into()).user_message(),
      "Error trimming the audio file: bad codec"
    );
  }
}
