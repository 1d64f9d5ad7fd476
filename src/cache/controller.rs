//! Cache controller: per-class request routing and generation lifecycle.
//!
//! Runs in the worker context. Requests are classified in precedence order
//! (API prefix, navigation, static) and each class gets its own strategy.
//! Caching of live responses is best-effort and never fails the response
//! path.

use color_eyre::{eyre::eyre, Report, Result};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::event::WorkerMessage;
use crate::net::{Fetcher, Request, RequestMode, Response, ResponseKind};

use super::storage::CacheStore;

/// Background sync tag registered when the page signals a completed sync.
pub const SYNC_TAG: &str = "sync-queue";

/// Worker lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Active(String),
  Terminated,
}

/// Platform facilities of the worker host. Both are best-effort: client
/// adoption is forced on activation, and background sync registration has
/// its own platform-side retry semantics.
pub trait WorkerHost: Send + Sync {
  fn claim_clients(&self);
  fn register_sync(&self, tag: &str) -> Result<()>;
}

/// Host without either facility.
pub struct NullHost;

impl WorkerHost for NullHost {
  fn claim_clients(&self) {}

  fn register_sync(&self, _tag: &str) -> Result<()> {
    Ok(())
  }
}

/// The worker-context half of the offline layer.
pub struct CacheController<S: CacheStore, F: Fetcher, H: WorkerHost> {
  store: S,
  fetcher: F,
  host: H,
  config: CacheConfig,
  origin: Url,
  state: Mutex<WorkerState>,
}

impl<S: CacheStore, F: Fetcher, H: WorkerHost> CacheController<S, F, H> {
  pub fn new(store: S, fetcher: F, host: H, config: CacheConfig) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid origin {}: {}", config.origin, e))?;

    Ok(Self {
      store,
      fetcher,
      host,
      config,
      origin,
      state: Mutex::new(WorkerState::Installing),
    })
  }

  pub fn state(&self) -> WorkerState {
    self
      .state
      .lock()
      .map(|state| state.clone())
      .unwrap_or(WorkerState::Terminated)
  }

  fn set_state(&self, next: WorkerState) {
    if let Ok(mut state) = self.state.lock() {
      *state = next;
    }
  }

  /// Resolve a manifest entry against the worker's origin. Absolute URLs
  /// (CDN assets) pass through unchanged.
  fn resolve(&self, resource: &str) -> Result<Url> {
    match Url::parse(resource) {
      Ok(url) => Ok(url),
      Err(_) => self
        .origin
        .join(resource)
        .map_err(|e| eyre!("Invalid shell resource {}: {}", resource, e)),
    }
  }

  /// Fetch and stage every shell-manifest resource. All fetches must succeed;
  /// a single failure aborts the install and stages nothing, leaving the
  /// prior generation (if any) in effect.
  pub async fn install(&self) -> Result<()> {
    let fetches = self
      .config
      .shell_manifest
      .iter()
      .map(|resource| {
        let request = Request::get(self.resolve(resource)?);
        Ok(async move {
          let response = self
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| eyre!("Shell resource {} failed to install: {}", request.url, e))?;
          if !response.is_success() {
            return Err(eyre!(
              "Shell resource {} returned {}",
              request.url,
              response.status
            ));
          }
          Ok::<_, Report>((request, response))
        })
      })
      .collect::<Result<Vec<_>>>()?;

    let entries = futures::future::try_join_all(fetches).await?;
    self
      .store
      .install_generation(&self.config.generation, &entries)?;

    info!(
      generation = %self.config.generation,
      resources = entries.len(),
      "cache generation installed"
    );
    Ok(())
  }

  /// Make the freshly installed generation current: every other generation
  /// is deleted, configured authenticated paths are purged, and all open
  /// clients are claimed immediately.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let removed = self.store.activate_generation(&self.config.generation)?;

    for path in &self.config.purge_on_activate {
      let request = Request::get(self.resolve(path)?);
      self.store.purge(&request)?;
    }

    self.set_state(WorkerState::Active(self.config.generation.clone()));
    self.host.claim_clients();

    info!(
      generation = %self.config.generation,
      removed = removed.len(),
      "cache generation activated"
    );
    Ok(removed)
  }

  /// This worker was superseded by a newer one.
  pub fn terminate(&self) {
    self.set_state(WorkerState::Terminated);
  }

  /// Route an intercepted request. Precedence: API prefix, then navigation,
  /// then static assets.
  pub async fn handle_request(&self, request: &Request) -> Result<Response> {
    if request.url.path().starts_with(&self.config.api_prefix) {
      self.network_first_api(request).await
    } else if request.mode == RequestMode::Navigate {
      self.network_first_navigation(request).await
    } else {
      self.cache_first(request).await
    }
  }

  async fn network_first_api(&self, request: &Request) -> Result<Response> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        let cacheable = response.is_html()
          || (response.kind == ResponseKind::Basic && response.status == 200);
        if cacheable {
          self.store_best_effort(request, &response);
        }
        Ok(response)
      }
      Err(err) => match self.lookup(request) {
        Some(cached) => Ok(cached),
        None => Err(err.wrap_err(format!("No cached copy for {}", request.url))),
      },
    }
  }

  async fn network_first_navigation(&self, request: &Request) -> Result<Response> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        // Non-200 responses are the server's answer; serve them live,
        // uncached.
        if response.status == 200 {
          self.store_best_effort(request, &response);
        }
        Ok(response)
      }
      Err(err) => {
        if let Some(cached) = self.lookup(request) {
          return Ok(cached);
        }
        let offline_page = Request::get(self.resolve(&self.config.offline_page)?);
        if let Some(page) = self.lookup(&offline_page) {
          return Ok(page);
        }
        Err(err.wrap_err("Offline with no cached page and no offline fallback"))
      }
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<Response> {
    if let Some(cached) = self.lookup(request) {
      return Ok(cached);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.status == 200 {
          self.store_best_effort(request, &response);
        }
        Ok(response)
      }
      Err(err) => {
        debug!(url = %request.url, "static fetch failed, serving synthetic offline: {}", err);
        Ok(Response::offline())
      }
    }
  }

  fn lookup(&self, request: &Request) -> Option<Response> {
    match self.store.get(request) {
      Ok(found) => found,
      Err(err) => {
        warn!(url = %request.url, "cache read failed: {}", err);
        None
      }
    }
  }

  fn store_best_effort(&self, request: &Request, response: &Response) {
    if let Err(err) = self.store.put(request, response) {
      warn!(url = %request.url, "cache write failed: {}", err);
    }
  }

  /// Advisory message from the page context.
  pub fn handle_message(&self, message: WorkerMessage) {
    match message {
      WorkerMessage::SyncNow => {
        if let Err(err) = self.host.register_sync(SYNC_TAG) {
          debug!("background sync registration failed: {}", err);
        }
      }
    }
  }
}
