//! Cache storage trait and SQLite implementation.
//!
//! Responses are grouped into named generations. Entries staged during an
//! install stay invisible to lookups until their generation is activated,
//! so a generation is never observed partially populated.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

use crate::net::{Request, Response, ResponseKind};

/// Trait for cache storage backends.
pub trait CacheStore: Send + Sync {
  /// Stage a complete generation in one transaction. Replaces any prior
  /// contents under the same name; does not make the generation current.
  fn install_generation(&self, name: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Make the named generation current and delete every other generation.
  /// Returns the names of the generations that were removed.
  fn activate_generation(&self, name: &str) -> Result<Vec<String>>;

  /// Name of the current generation, if one has been activated.
  fn current_generation(&self) -> Result<Option<String>>;

  /// Look up a cached response in the current generation.
  fn get(&self, request: &Request) -> Result<Option<Response>>;

  /// Store a response in the current generation (runtime caching).
  fn put(&self, request: &Request, response: &Response) -> Result<()>;

  /// Remove a cached entry across all generations.
  fn purge(&self, request: &Request) -> Result<()>;

  /// Names of all generations present in the registry.
  fn generation_names(&self) -> Result<Vec<String>>;
}

/// SQLite-based cache store.
pub struct SqliteCacheStore {
  conn: Mutex<Connection>,
}

impl SqliteCacheStore {
  /// Open or create the cache database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// In-memory store, used in tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for the generation registry and the cached responses.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    current INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS responses (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    kind TEXT NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_key)
);

CREATE INDEX IF NOT EXISTS idx_responses_key ON responses(request_key);
"#;

/// Stable fixed-length key from the request identity.
fn request_key(request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.identity().as_bytes());
  hex::encode(hasher.finalize())
}

fn insert_response(
  conn: &Connection,
  generation: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_vec(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO responses
         (generation, request_key, url, status, content_type, kind, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        request_key(request),
        request.url.as_str(),
        response.status,
        response.content_type,
        response.kind.as_str(),
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store response: {}", e))?;

  Ok(())
}

impl CacheStore for SqliteCacheStore {
  fn install_generation(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN IMMEDIATE", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let staged = (|| -> Result<()> {
      conn
        .execute("DELETE FROM responses WHERE generation = ?", params![name])
        .map_err(|e| eyre!("Failed to clear stale generation contents: {}", e))?;

      conn
        .execute(
          "INSERT OR IGNORE INTO generations (name) VALUES (?)",
          params![name],
        )
        .map_err(|e| eyre!("Failed to register generation: {}", e))?;

      for (request, response) in entries {
        insert_response(&conn, name, request, response)?;
      }

      Ok(())
    })();

    if let Err(err) = staged {
      let _ = conn.execute("ROLLBACK", []);
      return Err(err);
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn activate_generation(&self, name: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN IMMEDIATE", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let activated = (|| -> Result<Vec<String>> {
      let mut stmt = conn
        .prepare("SELECT name FROM generations WHERE name != ?")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let removed: Vec<String> = stmt
        .query_map(params![name], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list generations: {}", e))?
        .filter_map(|r| r.ok())
        .collect();
      drop(stmt);

      let updated = conn
        .execute(
          "UPDATE generations SET current = 1 WHERE name = ?",
          params![name],
        )
        .map_err(|e| eyre!("Failed to mark generation current: {}", e))?;
      if updated != 1 {
        return Err(eyre!("Generation {} was never installed", name));
      }

      conn
        .execute("DELETE FROM responses WHERE generation != ?", params![name])
        .map_err(|e| eyre!("Failed to evict old responses: {}", e))?;
      conn
        .execute("DELETE FROM generations WHERE name != ?", params![name])
        .map_err(|e| eyre!("Failed to evict old generations: {}", e))?;

      Ok(removed)
    })();

    match activated {
      Ok(removed) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(removed)
      }
      Err(err) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(err)
      }
    }
  }

  fn current_generation(&self) -> Result<Option<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations WHERE current = 1")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let name: Option<String> = stmt.query_row([], |row| row.get(0)).ok();
    Ok(name)
  }

  fn get(&self, request: &Request) -> Result<Option<Response>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT r.status, r.content_type, r.kind, r.headers, r.body
         FROM responses r
         INNER JOIN generations g ON g.name = r.generation AND g.current = 1
         WHERE r.request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, Option<String>, String, Vec<u8>, Vec<u8>)> = stmt
      .query_row(params![request_key(request)], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .ok();

    match row {
      Some((status, content_type, kind, headers, body)) => {
        let headers: Vec<(String, String)> = serde_json::from_slice(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(Response {
          status,
          content_type,
          kind: ResponseKind::parse(&kind)?,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, request: &Request, response: &Response) -> Result<()> {
    let conn = self.lock()?;

    let generation: Option<String> = conn
      .prepare("SELECT name FROM generations WHERE current = 1")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?
      .query_row([], |row| row.get(0))
      .ok();

    let generation = generation.ok_or_else(|| eyre!("No active cache generation"))?;
    insert_response(&conn, &generation, request, response)
  }

  fn purge(&self, request: &Request) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM responses WHERE request_key = ?",
        params![request_key(request)],
      )
      .map_err(|e| eyre!("Failed to purge cached entry: {}", e))?;

    Ok(())
  }

  fn generation_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://shop.example").unwrap().join(path).unwrap())
  }

  fn response(body: &str) -> Response {
    Response {
      status: 200,
      content_type: Some("text/css".to_string()),
      kind: ResponseKind::Basic,
      headers: vec![("cache-control".to_string(), "no-store".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  #[test]
  fn test_staged_generation_invisible_until_activated() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    let entries = vec![(request("/"), response("shell"))];
    store.install_generation("shell-v1", &entries).unwrap();

    assert_eq!(store.current_generation().unwrap(), None);
    assert!(store.get(&request("/")).unwrap().is_none());

    store.activate_generation("shell-v1").unwrap();
    assert_eq!(
      store.current_generation().unwrap(),
      Some("shell-v1".to_string())
    );
    let cached = store.get(&request("/")).unwrap().unwrap();
    assert_eq!(cached.body, b"shell");
    assert_eq!(cached.headers.len(), 1);
  }

  #[test]
  fn test_activation_removes_every_other_generation() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    store
      .install_generation("shell-v1", &[(request("/"), response("old"))])
      .unwrap();
    store.activate_generation("shell-v1").unwrap();

    store
      .install_generation("shell-v2", &[(request("/"), response("new"))])
      .unwrap();
    let removed = store.activate_generation("shell-v2").unwrap();

    assert_eq!(removed, vec!["shell-v1".to_string()]);
    assert_eq!(
      store.generation_names().unwrap(),
      vec!["shell-v2".to_string()]
    );
    assert_eq!(store.get(&request("/")).unwrap().unwrap().body, b"new");
  }

  #[test]
  fn test_activating_unknown_generation_fails() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    assert!(store.activate_generation("missing").is_err());
    assert_eq!(store.current_generation().unwrap(), None);
  }

  #[test]
  fn test_put_requires_active_generation() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    assert!(store.put(&request("/app.css"), &response("css")).is_err());

    store.install_generation("shell-v1", &[]).unwrap();
    store.activate_generation("shell-v1").unwrap();
    store.put(&request("/app.css"), &response("css")).unwrap();
    assert!(store.get(&request("/app.css")).unwrap().is_some());
  }

  #[test]
  fn test_purge_removes_entry() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    store
      .install_generation("shell-v1", &[(request("/account"), response("private"))])
      .unwrap();
    store.activate_generation("shell-v1").unwrap();

    assert!(store.get(&request("/account")).unwrap().is_some());
    store.purge(&request("/account")).unwrap();
    assert!(store.get(&request("/account")).unwrap().is_none());
  }

  #[test]
  fn test_reinstall_replaces_generation_contents() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    store
      .install_generation(
        "shell-v1",
        &[
          (request("/"), response("one")),
          (request("/a"), response("a")),
        ],
      )
      .unwrap();
    store
      .install_generation("shell-v1", &[(request("/"), response("two"))])
      .unwrap();
    store.activate_generation("shell-v1").unwrap();

    assert_eq!(store.get(&request("/")).unwrap().unwrap().body, b"two");
    assert!(store.get(&request("/a")).unwrap().is_none());
  }
}
