// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-memory registry of authenticated sessions and their open streams
//!
//! One [`SessionManager`] is shared by every connection handler in the
//! process. Capacity and duplicate checks happen under the per-key map
//! guard, so check-then-insert is atomic with respect to concurrent
//! calls on the same session.

use std::{collections::HashMap, time::SystemTime};

use dashmap::{mapref::entry::Entry, DashMap};

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum SessionError {
  #[error("Session id is already registered")]
  SessionExists,
  #[error("Session is not registered")]
  SessionNotFound,
  #[error("Stream id is already open on this session")]
  StreamExists,
  #[error("Session is at its open-stream limit")]
  StreamLimit,
}

impl SessionError {
  /// Short token used as a metrics label for the failure.
  pub fn reason(&self) -> &'static str {
    match self {
      SessionError::SessionExists => "session_exists",
      SessionError::SessionNotFound => "session_not_found",
      SessionError::StreamExists => "stream_exists",
      SessionError::StreamLimit => "stream_limit",
    }
  }
}

#[derive(Debug, Clone)]
pub struct Stream {
  pub id: String,
  pub created_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct Session {
  pub id: String,
  pub device_id: String,
  pub started_at: SystemTime,
  /// Per-session stream cap; zero defers to the manager-wide default.
  pub max_streams: usize,
  pub streams: HashMap<String, Stream>,
}

pub struct SessionManager {
  sessions: DashMap<String, Session>,
  default_max_streams: usize,
}

impl SessionManager {
  pub fn new(default_max_streams: usize) -> Self {
    Self {
      sessions: DashMap::new(),
      default_max_streams,
    }
  }

  /// Registers a session under the supplied id, or under a generated one
  /// when the id is empty. Returns a snapshot of the newly created
  /// session; an occupied id leaves the registry untouched.
  pub fn create_session(
    &self,
    id: &str,
    device_id: &str,
    max_streams: usize,
  ) -> Result<Session, SessionError> {
    let session_id = if id.is_empty() {
      uuid::Uuid::new_v4().to_string()
    } else {
      id.to_owned()
    };
    match self.sessions.entry(session_id.clone()) {
      Entry::Occupied(_) => Err(SessionError::SessionExists),
      Entry::Vacant(vacant) => {
        let session = Session {
          id: session_id,
          device_id: device_id.to_owned(),
          started_at: SystemTime::now(),
          max_streams,
          streams: HashMap::new(),
        };
        vacant.insert(session.clone());
        Ok(session)
      }
    }
  }

  /// Manager-wide cap applied to sessions that carry no cap of their own.
  pub fn default_max_streams(&self) -> usize {
    self.default_max_streams
  }

  pub fn close_session(&self, session_id: &str) {
    self.sessions.remove(session_id);
  }

  pub fn get_session(&self, session_id: &str) -> Option<Session> {
    self.sessions.get(session_id).map(|s| s.value().clone())
  }

  /// Adds a stream to the session's bookkeeping. The shard guard held by
  /// `get_mut` makes the limit check and the insertion atomic.
  pub fn open_stream(&self, session_id: &str, stream_id: &str) -> Result<(), SessionError> {
    let mut session = self
      .sessions
      .get_mut(session_id)
      .ok_or(SessionError::SessionNotFound)?;
    if session.streams.contains_key(stream_id) {
      return Err(SessionError::StreamExists);
    }
    let limit = if session.max_streams > 0 {
      session.max_streams
    } else {
      self.default_max_streams
    };
    if limit > 0 && session.streams.len() >= limit {
      return Err(SessionError::StreamLimit);
    }
    session.streams.insert(
      stream_id.to_owned(),
      Stream {
        id: stream_id.to_owned(),
        created_at: SystemTime::now(),
      },
    );
    Ok(())
  }

  /// Best-effort removal; unknown session or stream ids are a no-op.
  pub fn close_stream(&self, session_id: &str, stream_id: &str) {
    if let Some(mut session) = self.sessions.get_mut(session_id) {
      session.streams.remove(stream_id);
    }
  }

  pub fn has_stream(&self, session_id: &str, stream_id: &str) -> bool {
    self
      .sessions
      .get(session_id)
      .map(|s| s.streams.contains_key(stream_id))
      .unwrap_or(false)
  }

  /// Ids of every stream currently open on the session, for teardown.
  pub fn open_stream_ids(&self, session_id: &str) -> Vec<String> {
    self
      .sessions
      .get(session_id)
      .map(|s| s.streams.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub fn active_sessions(&self) -> usize {
    self.sessions.len()
  }

  pub fn active_streams(&self) -> usize {
    self
      .sessions
      .iter()
      .map(|entry| entry.value().streams.len())
      .sum()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::{SessionError, SessionManager};

  #[test]
  fn create_session_generates_id_when_empty() {
    let manager = SessionManager::new(4);
    let a = manager.create_session("", "dev1", 0).unwrap();
    let b = manager.create_session("", "dev1", 0).unwrap();
    assert!(!a.id.is_empty());
    assert_ne!(a.id, b.id);
    assert_eq!(manager.active_sessions(), 2);
  }

  #[test]
  fn create_session_rejects_duplicate_id() {
    let manager = SessionManager::new(4);
    manager.create_session("sess-1", "dev1", 0).unwrap();
    assert!(matches!(
      manager.create_session("sess-1", "dev2", 0),
      Err(SessionError::SessionExists)
    ));
    assert_eq!(manager.active_sessions(), 1);
  }

  #[test]
  fn open_stream_enforces_session_limit() {
    let manager = SessionManager::new(8);
    manager.create_session("sess-1", "dev1", 2).unwrap();
    manager.open_stream("sess-1", "s1").unwrap();
    manager.open_stream("sess-1", "s2").unwrap();
    assert_eq!(
      manager.open_stream("sess-1", "s3"),
      Err(SessionError::StreamLimit)
    );
    assert_eq!(manager.active_streams(), 2);
    // Closing one frees capacity again
    manager.close_stream("sess-1", "s1");
    manager.open_stream("sess-1", "s3").unwrap();
    assert_eq!(manager.active_streams(), 2);
  }

  #[test]
  fn open_stream_falls_back_to_manager_default_limit() {
    let manager = SessionManager::new(1);
    manager.create_session("sess-1", "dev1", 0).unwrap();
    manager.open_stream("sess-1", "s1").unwrap();
    assert_eq!(
      manager.open_stream("sess-1", "s2"),
      Err(SessionError::StreamLimit)
    );
  }

  #[test]
  fn open_stream_rejects_duplicates_without_changing_count() {
    let manager = SessionManager::new(4);
    manager.create_session("sess-1", "dev1", 0).unwrap();
    manager.open_stream("sess-1", "s1").unwrap();
    assert_eq!(
      manager.open_stream("sess-1", "s1"),
      Err(SessionError::StreamExists)
    );
    assert_eq!(manager.active_streams(), 1);
  }

  #[test]
  fn open_stream_requires_known_session() {
    let manager = SessionManager::new(4);
    assert_eq!(
      manager.open_stream("nope", "s1"),
      Err(SessionError::SessionNotFound)
    );
  }

  #[test]
  fn close_operations_are_idempotent() {
    let manager = SessionManager::new(4);
    manager.create_session("sess-1", "dev1", 0).unwrap();
    manager.close_stream("sess-1", "never-opened");
    manager.close_stream("absent-session", "s1");
    manager.close_session("sess-1");
    manager.close_session("sess-1");
    assert_eq!(manager.active_sessions(), 0);
  }

  #[tokio::test]
  async fn concurrent_opens_never_exceed_limit() {
    const LIMIT: usize = 8;
    let manager = Arc::new(SessionManager::new(0));
    manager.create_session("sess-1", "dev1", LIMIT).unwrap();
    let mut tasks = Vec::new();
    for worker in 0..4 {
      let manager = Arc::clone(&manager);
      tasks.push(tokio::task::spawn_blocking(move || {
        let mut opened = 0usize;
        for i in 0..32 {
          if manager
            .open_stream("sess-1", &format!("w{}-s{}", worker, i))
            .is_ok()
          {
            opened += 1;
          }
        }
        opened
      }));
    }
    let mut total = 0usize;
    for task in tasks {
      total += task.await.unwrap();
    }
    assert_eq!(total, LIMIT);
    assert_eq!(manager.active_streams(), LIMIT);
  }
}
