//! User registry and authentication
//!
//! Three modes, picked at startup: configured users (YAML file merged with
//! repeated -id/-secret pairs), an external auth API, or allow-any where the
//! first presenter of an unknown id claims it with a temp record that is
//! removed along with the agent's last tunnel.

use crate::config::UserEntry;
use crate::Error;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone)]
struct User {
    secret: String,
    /// Auto-created by allow-any mode; evaporates with the agent's last tunnel
    temp: bool,
}

/// Concurrent id -> secret table
#[derive(Default)]
pub struct Users {
    map: DashMap<String, User>,
}

impl Users {
    /// Merge the users file with positional -id/-secret pairs. Command-line
    /// pairs win over file entries of the same id.
    pub fn merge(
        &self,
        file_users: HashMap<String, UserEntry>,
        ids: &[String],
        secrets: &[String],
    ) -> Result<(), Error> {
        for (id, entry) in file_users {
            self.map.insert(
                id,
                User {
                    secret: entry.secret,
                    temp: false,
                },
            );
        }
        if ids.len() != secrets.len() {
            return Err(Error::Config(
                "the number of id does not match the number of secret".to_string(),
            ));
        }
        for (id, secret) in ids.iter().zip(secrets) {
            self.map.insert(
                id.clone(),
                User {
                    secret: secret.clone(),
                    temp: false,
                },
            );
        }
        Ok(())
    }

    /// Enforce the 1..=200 length bounds on every entry.
    pub fn verify(&self) -> Result<(), Error> {
        for entry in self.map.iter() {
            let id = entry.key();
            if id.len() < crate::MIN_ID_SIZE || id.len() > crate::MAX_ID_SIZE {
                return Err(Error::Config(format!("invalid id length: '{id}'")));
            }
            let secret = &entry.value().secret;
            if secret.len() < crate::MIN_ID_SIZE || secret.len() > crate::MAX_ID_SIZE {
                return Err(Error::Config(format!("invalid secret length for id '{id}'")));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn auth(&self, id: &str, secret: &str) -> bool {
        self.map
            .get(id)
            .map(|u| u.secret == secret)
            .unwrap_or(false)
    }

    /// Allow-any mode: authenticate against the existing record or claim the
    /// id with a temp record. The entry API runs the claim at most once per
    /// absent key, so racing claimants all compare against the winner.
    pub fn auth_or_claim(&self, id: &str, secret: &str) -> bool {
        let entry = self.map.entry(id.to_string()).or_insert_with(|| {
            debug!(id, "claimed by first presenter");
            User {
                secret: secret.to_string(),
                temp: true,
            }
        });
        entry.secret == secret
    }

    /// Drop the record only if it is a temp one.
    pub fn remove_temp(&self, id: &str) {
        self.map.remove_if(id, |_, u| u.temp);
    }

    #[cfg(test)]
    fn is_temp(&self, id: &str) -> Option<bool> {
        self.map.get(id).map(|u| u.temp)
    }
}

/// Authentication mode, fixed at startup
pub enum AuthMode {
    ConfigUsers,
    Api(String),
    AllowAny,
}

#[derive(Debug, Deserialize)]
struct AuthApiResponse {
    result: bool,
}

/// Authenticates handshakes against the configured mode.
pub struct Authenticator {
    mode: AuthMode,
    users: Users,
    http: reqwest::Client,
}

impl Authenticator {
    pub fn new(mode: AuthMode, users: Users) -> Self {
        crate::ensure_crypto_provider();
        Self {
            mode,
            users,
            http: reqwest::Client::new(),
        }
    }

    pub fn users(&self) -> &Users {
        &self.users
    }

    pub async fn auth(&self, id: &str, secret: &str) -> Result<(), Error> {
        if id.is_empty() || secret.is_empty() {
            return Err(Error::AuthInvalid);
        }
        let ok = match &self.mode {
            AuthMode::ConfigUsers => self.users.auth(id, secret),
            AuthMode::AllowAny => self.users.auth_or_claim(id, secret),
            AuthMode::Api(url) => self.auth_with_api(url, id, secret).await?,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::AuthInvalid)
        }
    }

    async fn auth_with_api(&self, url: &str, id: &str, secret: &str) -> Result<bool, Error> {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut body = HashMap::new();
        body.insert("clientId", id);
        body.insert("secretKey", secret);
        let resp = self
            .http
            .post(url)
            .header("Request-Id", epoch.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Config(format!("auth api request failed: {e}")))?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let parsed: AuthApiResponse = resp
            .json()
            .await
            .map_err(|e| Error::Config(format!("auth api returned invalid body: {e}")))?;
        Ok(parsed.result)
    }
}
