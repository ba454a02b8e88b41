//! Configuration for the server and client binaries

use crate::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Plain TCP listen address; supports "80", ":80" or "0.0.0.0:80"
    pub addr: String,
    /// TLS listen address; requires `cert_file` and `key_file`
    pub tls_addr: String,
    /// Raw TLS SNI-routing listen address
    pub sni_addr: String,
    pub cert_file: String,
    pub key_file: String,
    /// Minimum TLS protocol version: "tls1.2" or "tls1.3"
    pub tls_min_version: String,
    /// Ids paired positionally with `secrets`
    pub ids: Vec<String>,
    pub secrets: Vec<String>,
    /// Users YAML file path
    pub users_file: String,
    /// External authentication API url; overrides config users when set
    pub auth_api: String,
    /// Let the first presenter of an unknown id claim it
    pub allow_any_client: bool,
    /// The HTTP header whose value routes requests to agents
    pub http_mux_header: String,
    /// Read/write deadline for tunnels and task connections
    pub timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            addr: "80".to_string(),
            tls_addr: String::new(),
            sni_addr: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            tls_min_version: "tls1.2".to_string(),
            ids: Vec::new(),
            secrets: Vec::new(),
            users_file: String::new(),
            auth_api: String::new(),
            allow_any_client: false,
            http_mux_header: "Host".to_string(),
            timeout: Duration::from_secs(90),
        }
    }
}

impl ServerOptions {
    /// Normalize bare-port addresses and check listener/cert coherence.
    pub fn normalize(&mut self) -> Result<(), Error> {
        self.addr = normalize_addr(&self.addr);
        self.tls_addr = normalize_addr(&self.tls_addr);
        self.sni_addr = normalize_addr(&self.sni_addr);
        if !self.tls_addr.is_empty() && (self.cert_file.is_empty() || self.key_file.is_empty()) {
            return Err(Error::Config(
                "tlsAddr requires certFile and keyFile".to_string(),
            ));
        }
        if self.addr.is_empty() && self.tls_addr.is_empty() && self.sni_addr.is_empty() {
            return Err(Error::Config(
                "no listen address configured, set addr, tlsAddr or sniAddr".to_string(),
            ));
        }
        match self.tls_min_version.to_lowercase().as_str() {
            "tls1.2" | "tls1.3" => Ok(()),
            other => Err(Error::Config(format!(
                "unsupported tls min version '{other}', use tls1.2 or tls1.3"
            ))),
        }
    }
}

/// Client (agent) options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub id: String,
    pub secret: String,
    /// Server url: `tcp://host[:port]` or `tls://host[:port]`; a bare
    /// host:port means tcp
    pub remote: String,
    /// API returning the server url when `remote` is not set
    pub remote_api: String,
    /// Extra root CA for the tls remote
    pub remote_cert: String,
    /// Accept self-signed certs from the remote
    pub remote_cert_insecure: bool,
    /// Number of tunnel connections, clamped to 1..=3
    pub remote_connections: u32,
    pub remote_timeout: Duration,
    /// Local origin url: `http://host[:port]` or `https://host[:port]`
    pub local: String,
    pub local_timeout: Duration,
    /// Rewrite the Host header of proxied requests to the local origin host
    pub use_local_as_http_host: bool,
    pub reconnect_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            id: String::new(),
            secret: String::new(),
            remote: String::new(),
            remote_api: String::new(),
            remote_cert: String::new(),
            remote_cert_insecure: false,
            remote_connections: 1,
            remote_timeout: Duration::from_secs(5),
            local: String::new(),
            local_timeout: Duration::from_secs(120),
            use_local_as_http_host: false,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl ClientOptions {
    /// Validate id/secret bounds and url schemes, apply defaults.
    pub fn normalize(&mut self) -> Result<(), Error> {
        if self.id.len() < crate::MIN_ID_SIZE || self.id.len() > crate::MAX_ID_SIZE {
            return Err(Error::Config(format!("agent id '{}' is invalid", self.id)));
        }
        if self.secret.len() < crate::MIN_ID_SIZE || self.secret.len() > crate::MAX_ID_SIZE {
            return Err(Error::Config("agent secret is invalid".to_string()));
        }

        if !self.remote.is_empty() {
            if !self.remote.contains("://") {
                self.remote = format!("tcp://{}", self.remote);
            }
            if !self.remote.starts_with("tcp://") && !self.remote.starts_with("tls://") {
                return Err(Error::Config(format!(
                    "remote url '{}' must begin with tcp:// or tls://",
                    self.remote
                )));
            }
            self.remote = self.remote.trim_end_matches('/').to_string();
        } else if self.remote_api.is_empty() {
            return Err(Error::Config(
                "either remote or remoteAPI must be set".to_string(),
            ));
        }

        if !self.local.starts_with("http://") && !self.local.starts_with("https://") {
            return Err(Error::Config(format!(
                "local url '{}' must begin with http:// or https://",
                self.local
            )));
        }
        self.local = self.local.trim_end_matches('/').to_string();

        self.remote_connections = self.remote_connections.clamp(1, 3);
        Ok(())
    }
}

/// One user entry from the users YAML file
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub secret: String,
}

#[derive(Debug, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, UserEntry>,
}

/// Load the `users:` map from a YAML file.
pub fn load_users_file<P: AsRef<Path>>(path: P) -> Result<HashMap<String, UserEntry>, Error> {
    let content = std::fs::read_to_string(&path).map_err(|e| {
        Error::Config(format!(
            "failed to read users file '{}': {e}",
            path.as_ref().display()
        ))
    })?;
    let parsed: UsersFile = serde_yaml::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "failed to parse users file '{}': {e}",
            path.as_ref().display()
        ))
    })?;
    Ok(parsed.users)
}

/// Normalize a listen address: bare ports become ":port".
pub fn normalize_addr(addr: &str) -> String {
    if addr.is_empty() || addr.contains(':') {
        addr.to_string()
    } else {
        format!(":{addr}")
    }
}

/// Turn a normalized listen address into something bindable: ":80" means
/// all interfaces.
pub fn bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr("80"), ":80");
        assert_eq!(normalize_addr(":80"), ":80");
        assert_eq!(normalize_addr("0.0.0.0:80"), "0.0.0.0:80");
        assert_eq!(normalize_addr(""), "");
    }

    #[test]
    fn test_bind_addr() {
        assert_eq!(bind_addr(":80"), "0.0.0.0:80");
        assert_eq!(bind_addr("127.0.0.1:80"), "127.0.0.1:80");
    }

    #[test]
    fn test_server_options_require_listener() {
        let mut opts = ServerOptions {
            addr: String::new(),
            ..Default::default()
        };
        assert!(opts.normalize().is_err());
    }

    #[test]
    fn test_server_options_tls_requires_cert() {
        let mut opts = ServerOptions {
            tls_addr: "443".to_string(),
            ..Default::default()
        };
        assert!(opts.normalize().is_err());
        opts.cert_file = "cert.pem".to_string();
        opts.key_file = "key.pem".to_string();
        opts.normalize().unwrap();
        assert_eq!(opts.tls_addr, ":443");
    }

    #[test]
    fn test_client_options_defaults_remote_scheme() {
        let mut opts = ClientOptions {
            id: "abc".to_string(),
            secret: "xyz".to_string(),
            remote: "example.com:8080".to_string(),
            local: "http://127.0.0.1:3000/".to_string(),
            remote_connections: 9,
            ..Default::default()
        };
        opts.normalize().unwrap();
        assert_eq!(opts.remote, "tcp://example.com:8080");
        assert_eq!(opts.local, "http://127.0.0.1:3000");
        assert_eq!(opts.remote_connections, 3);
    }

    #[test]
    fn test_client_options_rejects_bad_schemes() {
        let mut opts = ClientOptions {
            id: "abc".to_string(),
            secret: "xyz".to_string(),
            remote: "udp://example.com".to_string(),
            local: "http://127.0.0.1".to_string(),
            ..Default::default()
        };
        assert!(opts.normalize().is_err());

        let mut opts = ClientOptions {
            id: "abc".to_string(),
            secret: "xyz".to_string(),
            remote: "tcp://example.com".to_string(),
            local: "ftp://127.0.0.1".to_string(),
            ..Default::default()
        };
        assert!(opts.normalize().is_err());
    }

    #[test]
    fn test_users_file_parse() {
        let dir = std::env::temp_dir().join("backhaul-users-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("users.yaml");
        std::fs::write(&path, "users:\n  abc:\n    secret: s1\n  def:\n    secret: s2\n")
            .unwrap();

        let users = load_users_file(&path).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users["abc"].secret, "s1");
        assert_eq!(users["def"].secret, "s2");
    }
}
