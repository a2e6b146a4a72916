//! Upload confirmation workflow.
//!
//! A session owns one remote bin. The requester uploads a file to it and presses
//! confirm; the bot checks for a file carrying the content marker, locks the bin,
//! pulls the file and deletes the bin. If nobody confirms before the deadline the
//! bin is deleted anyway. Every state change goes through a compare-and-swap on the
//! session so that two confirm clicks racing each other can never both pass.

use std::{
  future::Future,
  path::Path,
  sync::{
    atomic::{
      AtomicBool,
      AtomicU8,
      Ordering,
    },
    Arc,
  },
  time::Duration,
};

use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::storage::{
  ScratchStorage, SpaceId, StorageError
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState{
  Open = 0,
  Confirming = 1,
  Confirmed = 2,
  Failed = 3,
  Expired = 4,
  Closed = 5,
}

impl SessionState{
  fn from_u8(raw: u8) -> Self{
    match raw{
      0 => SessionState::Open,
      1 => SessionState::Confirming,
      2 => SessionState::Confirmed,
      3 => SessionState::Failed,
      4 => SessionState::Expired,
      _ => SessionState::Closed,
    }
  }
}

#[derive(Error, Debug)]
pub enum WorkflowError{
  #[error("Could not create a bin: {0}")]
  Allocation(#[source] StorageError),
  #[error("Confirmation attempted by someone other than the requester")]
  NotRequester,
  #[error("Upload already confirmed")]
  AlreadyConfirmed,
  #[error("No .{marker} file found in the bin")]
  VerificationFailed{
    marker: String,
  },
  #[error("Upload window has expired")]
  Expired,
  #[error("Could not retrieve the uploaded file: {0}")]
  RetrievalFailed(#[source] StorageError),
}

impl WorkflowError{
  pub fn user_message(&self) -> String{
    match self{
      WorkflowError::Allocation(_) => "Couldn't create a bin for your upload, please try again later.".to_string(),
      WorkflowError::NotRequester => "Only the person who ran /create can confirm this upload.".to_string(),
      WorkflowError::AlreadyConfirmed => "This upload has already been confirmed.".to_string(),
      WorkflowError::VerificationFailed{ marker } => format!(
        "No `.{marker}` file found in the bin yet. Upload it and press Confirm again."
      ),
      WorkflowError::Expired => "This upload window has expired. Run /create again.".to_string(),
      WorkflowError::RetrievalFailed(_) => "Your file was found but couldn't be retrieved. Please run /create again.".to_string(),
    }
  }
}

/// Payload carried along for the glyph processing step.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadMetadata{
  pub title: String,
  pub source_url: String,
  pub trim_begin: f64,
  pub trim_end: Option<f64>,
  pub watermark: String,
}

/// Handle for the confirm control: identifies the session and when it stops working.
#[derive(Debug, Clone)]
pub struct ConfirmationToken{
  session_id: String,
  expires_at: Instant,
}

impl ConfirmationToken{
  fn new(lifetime: Duration) -> Self{
    Self{
      session_id: uuid::Uuid::new_v4().simple().to_string(),
      expires_at: Instant::now() + lifetime,
    }
  }

  pub fn session_id(&self) -> &str{
    &self.session_id
  }

  pub fn expires_at(&self) -> Instant{
    self.expires_at
  }

  pub fn remaining(&self) -> Duration{
    self.expires_at.saturating_duration_since(Instant::now())
  }

  pub fn is_expired(&self) -> bool{
    Instant::now() > self.expires_at
  }

  fn deadline_reached(&self) -> bool{
    Instant::now() >= self.expires_at
  }
}

#[derive(Debug)]
pub struct UploadSession{
  token: ConfirmationToken,
  space: SpaceId,
  upload_url: String,
  requester_id: u64,
  metadata: UploadMetadata,
  state: AtomicU8,
  confirmed: AtomicBool,
}

impl UploadSession{
  pub fn id(&self) -> &str{
    self.token.session_id()
  }

  pub fn token(&self) -> &ConfirmationToken{
    &self.token
  }

  pub fn space(&self) -> &SpaceId{
    &self.space
  }

  pub fn upload_url(&self) -> &str{
    &self.upload_url
  }

  pub fn requester_id(&self) -> u64{
    self.requester_id
  }

  pub fn metadata(&self) -> &UploadMetadata{
    &self.metadata
  }

  pub fn state(&self) -> SessionState{
    SessionState::from_u8(self.state.load(Ordering::Acquire))
  }

  pub fn is_confirmed(&self) -> bool{
    self.confirmed.load(Ordering::Acquire)
  }

  /// Moves to `to` if the current state is one of `from`, returning the state that was replaced.
  fn transition(&self, from: &[SessionState], to: SessionState) -> Result<SessionState, SessionState>{
    let mut current = self.state();
    loop{
      if !from.contains(&current){
        return Err(current);
      }
      match self.state.compare_exchange(current as u8, to as u8, Ordering::AcqRel, Ordering::Acquire){
        Ok(_) => return Ok(current),
        Err(actual) => current = SessionState::from_u8(actual),
      }
    }
  }

  fn begin_confirm(&self) -> Result<(), WorkflowError>{
    let mut current = self.state();
    loop{
      match current{
        SessionState::Confirming | SessionState::Confirmed => return Err(WorkflowError::AlreadyConfirmed),
        SessionState::Closed if self.is_confirmed() => return Err(WorkflowError::AlreadyConfirmed),
        SessionState::Closed | SessionState::Expired => return Err(WorkflowError::Expired),
        SessionState::Open | SessionState::Failed => {
          if self.token.is_expired(){
            return Err(WorkflowError::Expired);
          }
          match self.transition(&[current], SessionState::Confirming){
            Ok(_) => {
              self.confirmed.store(true, Ordering::Release);
              return Ok(());
            },
            Err(actual) => current = actual,
          }
        },
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedFile{
  pub filename: String,
  pub content: Vec<u8>,
}

fn has_marker(filename: &str, marker: &str) -> bool{
  Path::new(filename)
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| ext.eq_ignore_ascii_case(marker))
}

pub struct UploadWorkflow<S>{
  storage: Arc<S>,
  timeout: Duration,
  marker: String,
}

impl<S> Clone for UploadWorkflow<S>{
  fn clone(&self) -> Self{
    Self{
      storage: Arc::clone(&self.storage),
      timeout: self.timeout,
      marker: self.marker.clone(),
    }
  }
}

impl<S: ScratchStorage> UploadWorkflow<S>{
  pub fn new(storage: Arc<S>, timeout: Duration, marker: impl Into<String>) -> Self{
    Self{
      storage,
      timeout,
      marker: marker.into(),
    }
  }

  pub fn marker(&self) -> &str{
    &self.marker
  }

  pub async fn start_session(&self, metadata: UploadMetadata, requester_id: u64) -> Result<Arc<UploadSession>, WorkflowError>{
    let space = match self.storage.create(&metadata.title).await{
      Ok(r) => r,
      Err(err) => {
        warn!(title = %metadata.title, error = %err, "Unable to allocate a bin");
        return Err(WorkflowError::Allocation(err));
      },
    };
    let session = Arc::new(UploadSession{
      token: ConfirmationToken::new(self.timeout),
      upload_url: self.storage.upload_url(&space),
      space,
      requester_id,
      metadata,
      state: AtomicU8::new(SessionState::Open as u8),
      confirmed: AtomicBool::new(false),
    });
    info!(
      session = %session.id(),
      bin = %session.space,
      requester = requester_id,
      "Started upload session"
    );
    Ok(session)
  }

  pub async fn confirm(&self, session: &UploadSession, acting_user_id: u64) -> Result<RetrievedFile, WorkflowError>{
    if acting_user_id != session.requester_id{
      debug!(session = %session.id(), acting_user_id, "Ignoring confirmation from someone else");
      return Err(WorkflowError::NotRequester);
    }
    session.begin_confirm()?;

    let files = match self.storage.list_files(&session.space).await{
      Ok(r) => r,
      Err(err) => {
        warn!(session = %session.id(), error = %err, "Unable to list bin contents");
        Vec::new()
      },
    };
    let filename = match files.into_iter().find(|f| has_marker(f, &self.marker)){
      Some(r) => r,
      None => {
        session.confirmed.store(false, Ordering::Release);
        let _ = session.transition(&[SessionState::Confirming], SessionState::Failed);
        info!(session = %session.id(), "No marked file in bin yet");
        // the timer may have fired while we were listing; past the deadline there is no retry
        if session.token.deadline_reached(){
          self.expire(session).await;
          return Err(WorkflowError::Expired);
        }
        return Err(WorkflowError::VerificationFailed{
          marker: self.marker.clone(),
        });
      },
    };

    match self.retrieve(&session.space, &filename).await{
      Ok(content) => {
        let _ = session.transition(&[SessionState::Confirming], SessionState::Confirmed);
        info!(session = %session.id(), file = %filename, bytes = content.len(), "Upload confirmed");
        self.teardown(session).await;
        Ok(RetrievedFile{ filename, content })
      },
      Err(err) => {
        error!(session = %session.id(), file = %filename, error = %err, "Unable to retrieve uploaded file");
        self.teardown(session).await;
        Err(WorkflowError::RetrievalFailed(err))
      },
    }
  }

  async fn retrieve(&self, space: &SpaceId, filename: &str) -> Result<Vec<u8>, StorageError>{
    self.storage.lock(space).await?;
    self.storage.download_file(space, filename).await
  }

  /// Closes an unconfirmed session. Returns false when it had already moved on.
  pub async fn expire(&self, session: &UploadSession) -> bool{
    if session.transition(&[SessionState::Open, SessionState::Failed], SessionState::Expired).is_err(){
      return false;
    }
    info!(session = %session.id(), "Upload window expired");
    self.teardown(session).await;
    true
  }

  // Callers must be the only path out of their current state. A failed delete is
  // only logged: the session closes either way.
  async fn teardown(&self, session: &UploadSession){
    let result = self.storage.delete(&session.space).await;
    session.state.store(SessionState::Closed as u8, Ordering::Release);
    match result{
      Ok(()) => debug!(session = %session.id(), bin = %session.space, "Deleted bin"),
      Err(err) => error!(session = %session.id(), bin = %session.space, error = %err, "Unable to delete bin"),
    }
  }
}

impl<S: ScratchStorage + 'static> UploadWorkflow<S>{
  /// Spawns the session's deadline. `on_expired` runs once the deadline has passed and
  /// is told whether this timer was the one that closed the session.
  pub fn arm_expiry<F, Fut>(&self, session: Arc<UploadSession>, on_expired: F) -> JoinHandle<()>
  where
    F: FnOnce(bool) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let workflow = self.clone();
    tokio::spawn(async move{
      tokio::time::sleep_until(session.token.expires_at()).await;
      let expired = workflow.expire(&session).await;
      on_expired(expired).await;
    })
  }
}
