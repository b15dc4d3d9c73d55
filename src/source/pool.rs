//! Client pool with scoped checkout
//!
//! A client is checked out for exactly one listing or retrieval and goes back
//! to the pool when its [`PooledClient`] guard is dropped, on every exit path.

use super::Connector;
use crate::error::ConnectError;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

/// Default number of concurrently checked-out clients
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// A checked-out client, returned to the pool on drop
pub struct PooledClient<'a, C: Connector> {
    /// The client (Option for taking on drop)
    client: Option<C::Client>,
    pool: &'a ClientPool<C>,
    // Released after the client is back in the idle list
    _permit: SemaphorePermit<'a>,
}

impl<'a, C: Connector> PooledClient<'a, C> {
    /// Drop the client instead of returning it, e.g. after the connection
    /// broke mid-call.
    pub fn discard(mut self) {
        if self.client.take().is_some() {
            debug!("Discarding source client");
        }
    }
}

impl<'a, C: Connector> Deref for PooledClient<'a, C> {
    type Target = C::Client;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref().expect("Client already taken")
    }
}

impl<'a, C: Connector> DerefMut for PooledClient<'a, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut().expect("Client already taken")
    }
}

impl<'a, C: Connector> Drop for PooledClient<'a, C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
        }
    }
}

/// Pool of protocol clients shared by listing and retrieval
pub struct ClientPool<C: Connector> {
    connector: C,
    /// Idle clients ready for reuse
    idle: Mutex<Vec<C::Client>>,
    /// Limits total checked-out clients
    semaphore: Semaphore,
    max_connections: usize,
}

impl<C: Connector> ClientPool<C> {
    pub fn new(connector: C, max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(max_connections)),
            semaphore: Semaphore::new(max_connections),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<C::Client>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a client, reusing an idle one when available.
    ///
    /// Waits while `max_connections` clients are already checked out.
    pub async fn acquire(&self) -> Result<PooledClient<'_, C>, ConnectError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ConnectError::PoolClosed)?;

        let reused = self.lock_idle().pop();
        let client = match reused {
            Some(client) => client,
            None => {
                debug!("Opening new source client");
                self.connector.connect().await?
            }
        };

        Ok(PooledClient {
            client: Some(client),
            pool: self,
            _permit: permit,
        })
    }

    fn release(&self, client: C::Client) {
        if self.semaphore.is_closed() {
            return;
        }
        self.lock_idle().push(client);
    }

    /// Number of idle clients waiting for reuse
    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    /// Clients that can be checked out right now without waiting
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Refuse further checkouts and drop idle clients
    pub fn close(&self) {
        self.semaphore.close();
        self.lock_idle().clear();
    }
}
