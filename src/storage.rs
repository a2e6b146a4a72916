//! Client for the temporary bin service that requesters upload their glyph files to.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{header, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError{
  #[error("Bin service request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("Bin service answered {status} for {url}")]
  Status{
    status: StatusCode,
    url: String,
  },
  #[error("Unreadable bin listing: {0}")]
  Listing(#[from] serde_json::Error),
  #[error("Invalid bin service url: {0}")]
  Url(String),
}

/// Opaque identifier of one remote bin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpaceId(String);

impl SpaceId{
  pub fn new(id: impl Into<String>) -> Self{
    Self(id.into())
  }

  pub fn as_str(&self) -> &str{
    &self.0
  }
}

impl fmt::Display for SpaceId{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result{
    f.write_str(&self.0)
  }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScratchStorage: Send + Sync{
  /// Reserve a fresh bin. The label only flavours the generated id.
  async fn create(&self, label: &str) -> Result<SpaceId, StorageError>;
  /// Public address the requester uploads to.
  fn upload_url(&self, space: &SpaceId) -> String;
  async fn list_files(&self, space: &SpaceId) -> Result<Vec<String>, StorageError>;
  async fn download_file(&self, space: &SpaceId, filename: &str) -> Result<Vec<u8>, StorageError>;
  /// Reject further uploads to the bin.
  async fn lock(&self, space: &SpaceId) -> Result<(), StorageError>;
  async fn delete(&self, space: &SpaceId) -> Result<(), StorageError>;
}

#[derive(Deserialize, Debug)]
struct BinListing{
  #[serde(default)]
  files: Option<Vec<BinFile>>,
}

#[derive(Deserialize, Debug)]
struct BinFile{
  filename: String,
}

pub struct FilebinClient{
  client: reqwest::Client,
  base: Url,
}

impl FilebinClient{
  pub fn new(base_url: &str) -> Result<Self, StorageError>{
    let mut headers = header::HeaderMap::new();
    headers.insert("accept", header::HeaderValue::from_static("application/json"));
    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(Duration::from_secs(30))
      .build()?;
    //add the / at the end of the server url if it's not there
    let mut base = base_url.to_string();
    if !base.ends_with('/'){
      base.push('/');
    }
    let base = Url::parse(&base).map_err(|err| StorageError::Url(format!("{base_url}: {err}")))?;
    if base.cannot_be_a_base(){
      return Err(StorageError::Url(base_url.to_string()));
    }
    Ok(Self{ client, base })
  }

  fn bin_url(&self, space: &SpaceId) -> Url{
    self.join(&[space.as_str()])
  }

  fn file_url(&self, space: &SpaceId, filename: &str) -> Url{
    self.join(&[space.as_str(), filename])
  }

  fn join(&self, segments: &[&str]) -> Url{
    let mut url = self.base.clone();
    if let Ok(mut path) = url.path_segments_mut(){
      path.pop_if_empty().extend(segments);
    }
    url
  }
}

fn check_status(res: reqwest::Response) -> Result<reqwest::Response, StorageError>{
  if res.status().is_success(){
    Ok(res)
  }else{
    Err(StorageError::Status{
      status: res.status(),
      url: res.url().to_string(),
    })
  }
}

/// Bin ids are lowercase alphanumerics: a slug of the label followed by random hex.
fn mint_bin_id(label: &str) -> String{
  let slug: String = label.chars()
    .filter(char::is_ascii_alphanumeric)
    .map(|c| c.to_ascii_lowercase())
    .take(16)
    .collect();
  let random = uuid::Uuid::new_v4().simple().to_string();
  format!("{slug}{}", &random[..16])
}

fn parse_listing(body: &str) -> Result<Vec<String>, serde_json::Error>{
  let listing: BinListing = serde_json::from_str(body)?;
  Ok(listing.files.unwrap_or_default().into_iter().map(|f| f.filename).collect())
}

#[async_trait]
impl ScratchStorage for FilebinClient{
  async fn create(&self, label: &str) -> Result<SpaceId, StorageError>{
    let space = SpaceId::new(mint_bin_id(label));
    let res = self.client.get(self.bin_url(&space)).send().await?;
    // bins come into existence with their first upload, so an unknown id is a free one
    match res.status(){
      StatusCode::OK | StatusCode::NOT_FOUND => {
        debug!(bin = %space, "reserved bin");
        Ok(space)
      },
      status => Err(StorageError::Status{
        status,
        url: res.url().to_string(),
      }),
    }
  }

  fn upload_url(&self, space: &SpaceId) -> String{
    self.bin_url(space).to_string()
  }

  async fn list_files(&self, space: &SpaceId) -> Result<Vec<String>, StorageError>{
    let res = self.client.get(self.bin_url(space)).send().await?;
    if res.status() == StatusCode::NOT_FOUND{
      return Ok(Vec::new());
    }
    let body = check_status(res)?.text().await?;
    Ok(parse_listing(&body)?)
  }

  async fn download_file(&self, space: &SpaceId, filename: &str) -> Result<Vec<u8>, StorageError>{
    let res = self.client.get(self.file_url(space, filename))
      .header("accept", "*/*")
      .send()
      .await?;
    Ok(check_status(res)?.bytes().await?.to_vec())
  }

  async fn lock(&self, space: &SpaceId) -> Result<(), StorageError>{
    let res = self.client.put(self.bin_url(space)).send().await?;
    check_status(res)?;
    Ok(())
  }

  async fn delete(&self, space: &SpaceId) -> Result<(), StorageError>{
    let res = self.client.delete(self.bin_url(space)).send().await?;
    check_status(res)?;
    Ok(())
  }
}
