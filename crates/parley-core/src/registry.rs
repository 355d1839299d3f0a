// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory session registry keyed by logical id and connection id

use crate::error::{SessionError, SessionResult};
use crate::session::{ClientLink, Session};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Maps {
    by_id: HashMap<String, Arc<Session>>,
    by_connection: HashMap<String, Arc<Session>>,
}

/// Both maps sit behind one lock, so a rebind is never observed half-done.
#[derive(Default)]
pub struct SessionRegistry {
    maps: Mutex<Maps>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a duplex session under its logical id and connection id.
    pub fn create(&self, session: Arc<Session>) -> SessionResult<()> {
        let connection_id = session
            .connection_id()
            .ok_or_else(|| SessionError::NotConnected(session.id().to_string()))?;

        let mut maps = self.maps.lock();
        if let Some(existing) = maps.by_id.get(session.id()) {
            if !Arc::ptr_eq(existing, &session) {
                return Err(SessionError::AlreadyRegistered(session.id().to_string()));
            }
        }
        if let Some(existing) = maps.by_connection.get(&connection_id) {
            if !Arc::ptr_eq(existing, &session) {
                return Err(SessionError::AlreadyRegistered(connection_id));
            }
        }

        maps.by_id.insert(session.id().to_string(), session.clone());
        maps.by_connection.insert(connection_id, session);
        Ok(())
    }

    pub fn lookup_by_connection(&self, connection_id: &str) -> Option<Arc<Session>> {
        self.maps.lock().by_connection.get(connection_id).cloned()
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.maps.lock().by_id.get(id).cloned()
    }

    pub fn require_by_id(&self, id: &str) -> SessionResult<Arc<Session>> {
        self.lookup_by_id(id)
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))
    }

    pub fn require_by_connection(&self, connection_id: &str) -> SessionResult<Arc<Session>> {
        self.lookup_by_connection(connection_id)
            .ok_or_else(|| SessionError::SessionNotFound(connection_id.to_string()))
    }

    /// Move `session` to `connection_id`, dropping its previous connection
    /// mapping and marking it restored.
    pub fn rebind(
        &self,
        session: &Arc<Session>,
        connection_id: &str,
        link: Arc<dyn ClientLink>,
    ) -> SessionResult<()> {
        let mut maps = self.maps.lock();
        if let Some(existing) = maps.by_connection.get(connection_id) {
            if !Arc::ptr_eq(existing, session) {
                return Err(SessionError::AlreadyRegistered(connection_id.to_string()));
            }
        }

        let previous = session
            .restore(connection_id, link)
            .ok_or_else(|| SessionError::NotConnected(session.id().to_string()))?;
        if maps
            .by_connection
            .get(&previous)
            .is_some_and(|existing| Arc::ptr_eq(existing, session))
        {
            maps.by_connection.remove(&previous);
        }
        maps.by_connection.insert(connection_id.to_string(), session.clone());
        maps.by_id.insert(session.id().to_string(), session.clone());
        Ok(())
    }

    /// Remove both mappings of `session`. Returns false if it was not
    /// registered.
    pub fn delete(&self, session: &Arc<Session>) -> bool {
        let mut maps = self.maps.lock();
        Self::remove_locked(&mut maps, session)
    }

    /// Delete the session still reachable through `connection_id`, but only
    /// if that id is its current connection.
    pub fn expire_connection(&self, connection_id: &str) -> Option<Arc<Session>> {
        let mut maps = self.maps.lock();
        let session = maps.by_connection.get(connection_id).cloned()?;
        if session.connection_id().as_deref() != Some(connection_id) {
            return None;
        }
        Self::remove_locked(&mut maps, &session);
        Some(session)
    }

    fn remove_locked(maps: &mut Maps, session: &Arc<Session>) -> bool {
        let mut removed = false;
        if maps
            .by_id
            .get(session.id())
            .is_some_and(|existing| Arc::ptr_eq(existing, session))
        {
            maps.by_id.remove(session.id());
            removed = true;
        }
        maps.by_connection.retain(|_, existing| {
            let same = Arc::ptr_eq(existing, session);
            removed |= same;
            !same
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.maps.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
