// src/services/session.rs
use log::{debug, error, warn};
use reqwest::{Client, Response};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::error::{DataError, Result};
use super::proxy::{ProxyEndpoint, ProxyPool};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// A client handed out by the session, tagged with the generation it belongs to.
#[derive(Clone)]
pub struct SessionClient {
    pub client: Client,
    pub proxy: Option<ProxyEndpoint>,
    generation: u64,
}

/// HTTP client bound to at most one proxy. Acquisition and rotation go
/// through one lock so concurrent workers never rebuild the client twice
/// for the same failure.
pub struct NetworkSession {
    pool: Arc<ProxyPool>,
    timeout: Duration,
    max_attempts: u32,
    active: Mutex<Option<SessionClient>>,
}

impl NetworkSession {
    pub fn new(pool: Arc<ProxyPool>, timeout: Duration, max_attempts: u32) -> Self {
        NetworkSession {
            pool,
            timeout,
            max_attempts: max_attempts.max(1),
            active: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    fn active(&self) -> MutexGuard<'_, Option<SessionClient>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The active client, created on first use and rebuilt whenever the
    /// pool's enabled flag no longer matches how the client is bound.
    pub fn current(&self) -> Result<SessionClient> {
        let mut active = self.active();
        let enabled = self.pool.is_enabled();
        if let Some(session) = active.as_ref() {
            if session.proxy.is_some() == enabled {
                return Ok(session.clone());
            }
        }

        let proxy = self.pool.acquire();
        if let Some(session) = active.as_ref() {
            // Enabled but the pool is empty: the direct client still stands.
            if proxy.is_none() && session.proxy.is_none() {
                return Ok(session.clone());
            }
        }

        let client = build_client(proxy.as_ref(), self.timeout)?;
        let generation = active.as_ref().map_or(0, |s| s.generation + 1);
        match &proxy {
            Some(p) => debug!("Session bound to proxy {}", p),
            None if active.is_some() => debug!("Proxying disabled, session going direct"),
            None => {}
        }
        let session = SessionClient { client, proxy, generation };
        *active = Some(session.clone());
        Ok(session)
    }

    /// Move to a different proxy. When no rotation is possible the existing
    /// client stays in place.
    pub fn rotate(&self) -> Option<ProxyEndpoint> {
        let mut active = self.active();
        self.rotate_locked(&mut active)
    }

    /// Rotate only if nobody has replaced the client since `generation` was handed out.
    fn rotate_from(&self, generation: u64) {
        let mut active = self.active();
        match active.as_ref() {
            Some(session) if session.generation != generation => {
                debug!("Client already rotated by another worker, reusing it");
            }
            _ => {
                self.rotate_locked(&mut active);
            }
        }
    }

    fn rotate_locked(&self, active: &mut Option<SessionClient>) -> Option<ProxyEndpoint> {
        let next = self.pool.rotate()?;
        match build_client(Some(&next), self.timeout) {
            Ok(client) => {
                let generation = active.as_ref().map_or(0, |s| s.generation + 1);
                debug!("Rotated session to proxy {}", next);
                *active = Some(SessionClient { client, proxy: Some(next.clone()), generation });
                Some(next)
            }
            Err(e) => {
                warn!("Could not build client for proxy {}: {}. Keeping current client.", next, e);
                None
            }
        }
    }

    /// Run `op` with the active client up to `max_attempts` times, rotating
    /// the proxy between attempts. Only transient failures are retried.
    pub async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(Client) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let session = self.current()?;
            match op(session.client.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!("Attempt {} for {} failed: {}. Rotating proxy.", attempt, what, e);
                    self.rotate_from(session.generation);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!("All attempts for {} failed: {}", what, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

fn build_client(proxy: Option<&ProxyEndpoint>, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder().user_agent(USER_AGENT).timeout(timeout);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy.as_str())
            .map_err(|e| DataError::Network(format!("invalid proxy {}: {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }
    Ok(builder.build()?)
}

/// Body text of a successful response; any other status is a transient failure.
pub async fn checked_text(resp: Response) -> Result<String> {
    let status = resp.status();
    if !status.is_success() {
        return Err(DataError::Status {
            status: status.as_u16(),
            url: resp.url().to_string(),
        });
    }
    Ok(resp.text().await?)
}
