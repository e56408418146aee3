use std::fmt;
use std::str::FromStr;

use adalink_core::error::ConfigError;
use adalink_core::types::{Dbid, Fnr};
use serde::{Deserialize, Serialize};

/// How the target is reached, derived from the connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    /// In-process database reached through the local adapter.
    Local,
    /// Remote database reached over the framed TCP protocol.
    Network,
    /// Remote database over TLS. Parsed, not currently servable.
    SecureNetwork,
    /// Pseudo-target: the database behind a map repository entry.
    MapPseudo,
}

/// A parsed connection string.
///
/// Grammar: `<driver>;<option>;...` with driver `acj` or `adatcp` and
/// options `target=<dbid>`, `target=<dbid>(adatcp://host:port)`,
/// `inmap=<dbid>`, `map` / `map=<name>`, `auth=<name>`, `id=<n>`,
/// `user=<name>`, `config=[<dbid>,<fnr>]`. The first unknown key fails the
/// parse. The serialised form is stable, so it can key caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Url {
    pub scheme: Scheme,
    pub driver: String,
    pub dbid: Dbid,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub map_name: Option<String>,
    pub inmap: bool,
    pub auth: Option<String>,
    pub id: Option<u32>,
    pub user: Option<String>,
    /// Repository location from `config=[dbid,fnr]`.
    pub config: Option<(Dbid, Fnr)>,
}

impl Url {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut chunks = input.split(';');
        let driver = chunks.next().unwrap_or("").trim();
        if driver != "acj" && driver != "adatcp" {
            return Err(ConfigError::MalformedUrl {
                reason: format!("unknown driver prefix: {driver:?}"),
            });
        }

        let mut target: Option<Dbid> = None;
        let mut inmap_target: Option<Dbid> = None;
        let mut host = None;
        let mut port = None;
        let mut secure = false;
        let mut map_flag = false;
        let mut map_name = None;
        let mut auth = None;
        let mut id = None;
        let mut user = None;
        let mut config = None;

        for chunk in chunks {
            let chunk = chunk.trim();
            if chunk.is_empty() {
                continue;
            }
            if chunk == "map" {
                map_flag = true;
                continue;
            }
            let (key, raw_value) = chunk.split_once('=').ok_or_else(|| {
                ConfigError::MalformedUrl {
                    reason: format!("option without value: {chunk:?}"),
                }
            })?;
            let value = unquote(raw_value.trim());
            match key.trim() {
                "target" => {
                    let (dbid, remote) = parse_target(value)?;
                    target = Some(dbid);
                    if let Some((h, p, s)) = remote {
                        host = Some(h);
                        port = Some(p);
                        secure = s;
                    }
                }
                "inmap" => {
                    inmap_target = Some(parse_dbid(value)?);
                }
                "map" => {
                    map_flag = true;
                    map_name = Some(value.to_string());
                }
                "auth" => auth = Some(value.to_string()),
                "id" => {
                    id = Some(value.parse::<u32>().map_err(|_| {
                        ConfigError::MalformedUrl {
                            reason: format!("invalid id: {value:?}"),
                        }
                    })?);
                }
                "user" => user = Some(value.to_string()),
                "config" => config = Some(parse_config(value)?),
                other => {
                    return Err(ConfigError::UnknownOption {
                        key: other.to_string(),
                    });
                }
            }
        }

        if inmap_target.is_some() && target.is_some() {
            return Err(ConfigError::ConflictingOptions {
                first: "inmap",
                second: "target",
            });
        }
        let inmap = inmap_target.is_some();
        let dbid = match (target, inmap_target, config) {
            (Some(d), _, _) | (_, Some(d), _) => d,
            (None, None, Some((d, _))) => d,
            (None, None, None) => {
                return Err(ConfigError::MalformedUrl {
                    reason: "no target database".to_string(),
                })
            }
        };

        let scheme = if map_flag {
            Scheme::MapPseudo
        } else if secure {
            Scheme::SecureNetwork
        } else if host.is_some() || driver == "adatcp" {
            Scheme::Network
        } else {
            Scheme::Local
        };
        if scheme == Scheme::Network && host.is_none() && driver == "adatcp" {
            return Err(ConfigError::MalformedUrl {
                reason: "adatcp driver requires a remote target host:port".to_string(),
            });
        }

        Ok(Url {
            scheme,
            driver: driver.to_string(),
            dbid,
            host,
            port,
            map_name,
            inmap,
            auth,
            id,
            user,
            config,
        })
    }

    /// Repository file number when the URL selects the map pseudo-scheme.
    pub fn repository_fnr(&self) -> Option<Fnr> {
        self.config.map(|(_, fnr)| fnr)
    }
}

impl FromStr for Url {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::parse(s)
    }
}

impl fmt::Display for Url {
    /// Stable serialisation: driver, then options in a fixed order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.driver)?;
        if self.scheme == Scheme::MapPseudo {
            match &self.map_name {
                Some(name) => write!(f, ";map={name}")?,
                None => write!(f, ";map")?,
            }
        }
        if self.inmap {
            write!(f, ";inmap={}", self.dbid)?;
        } else if self.config.map(|(d, _)| d) != Some(self.dbid) {
            write!(f, ";target={}", self.dbid)?;
            if let (Some(host), Some(port)) = (&self.host, self.port) {
                let proto = if self.scheme == Scheme::SecureNetwork {
                    "adatcps"
                } else {
                    "adatcp"
                };
                write!(f, "({proto}://{host}:{port})")?;
            }
        }
        if let Some(name) = &self.auth {
            write!(f, ";auth={name}")?;
        }
        if let Some(id) = self.id {
            write!(f, ";id={id}")?;
        }
        if let Some(user) = &self.user {
            write!(f, ";user={user}")?;
        }
        if let Some((dbid, fnr)) = self.config {
            write!(f, ";config=[{dbid},{fnr}]")?;
        }
        Ok(())
    }
}

fn unquote(value: &str) -> &str {
    let b = value.as_bytes();
    if b.len() >= 2 && (b[0] == b'"' || b[0] == b'\'') && b[b.len() - 1] == b[0] {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn parse_dbid(value: &str) -> Result<Dbid, ConfigError> {
    value
        .parse::<u32>()
        .map(Dbid)
        .map_err(|_| ConfigError::InvalidDbid {
            value: value.to_string(),
        })
}

type Remote = (String, u16, bool);

/// `<dbid>` or `<dbid>(adatcp://host:port)`; `adatcps` selects TLS.
fn parse_target(value: &str) -> Result<(Dbid, Option<Remote>), ConfigError> {
    let Some(open) = value.find('(') else {
        return Ok((parse_dbid(value)?, None));
    };
    let dbid = parse_dbid(&value[..open])?;
    let inner = value[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| ConfigError::MalformedUrl {
            reason: format!("unterminated remote target: {value:?}"),
        })?;
    let (proto, address) = inner.split_once("://").ok_or_else(|| {
        ConfigError::MalformedUrl {
            reason: format!("remote target needs a protocol: {inner:?}"),
        }
    })?;
    let secure = match proto {
        "adatcp" => false,
        "adatcps" => true,
        other => {
            return Err(ConfigError::MalformedUrl {
                reason: format!("unknown remote protocol: {other:?}"),
            })
        }
    };
    let (host, port_text) =
        address
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::MalformedUrl {
                reason: format!("remote target needs host:port: {address:?}"),
            })?;
    if host.is_empty() {
        return Err(ConfigError::MalformedUrl {
            reason: "empty remote host".to_string(),
        });
    }
    let port = port_text
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort {
            value: port_text.to_string(),
        })?;
    Ok((dbid, Some((host.to_string(), port, secure))))
}

/// `[dbid,fnr]` repository coordinates.
fn parse_config(value: &str) -> Result<(Dbid, Fnr), ConfigError> {
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .ok_or_else(|| ConfigError::MalformedUrl {
            reason: format!("config must be [dbid,fnr]: {value:?}"),
        })?;
    let (dbid_text, fnr_text) =
        inner
            .split_once(',')
            .ok_or_else(|| ConfigError::MalformedUrl {
                reason: format!("config must be [dbid,fnr]: {value:?}"),
            })?;
    let dbid = parse_dbid(dbid_text.trim())?;
    let fnr = fnr_text
        .trim()
        .parse::<u32>()
        .map(Fnr)
        .map_err(|_| ConfigError::MalformedUrl {
            reason: format!("invalid repository file number: {fnr_text:?}"),
        })?;
    Ok((dbid, fnr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_target() {
        let url = Url::parse("acj;target=24").unwrap();
        assert_eq!(url.scheme, Scheme::Local);
        assert_eq!(url.dbid, Dbid(24));
        assert!(url.host.is_none());
        assert!(url.config.is_none());
    }

    #[test]
    fn map_pseudo_with_config() {
        let url = Url::parse("acj;map;config=[24,4]").unwrap();
        assert_eq!(url.scheme, Scheme::MapPseudo);
        assert_eq!(url.dbid, Dbid(24));
        assert_eq!(url.config, Some((Dbid(24), Fnr(4))));
        assert_eq!(url.repository_fnr(), Some(Fnr(4)));
    }

    #[test]
    fn remote_target() {
        let url = Url::parse("adatcp;target=201(adatcp://db.example.com:60001)").unwrap();
        assert_eq!(url.scheme, Scheme::Network);
        assert_eq!(url.dbid, Dbid(201));
        assert_eq!(url.host.as_deref(), Some("db.example.com"));
        assert_eq!(url.port, Some(60001));
    }

    #[test]
    fn secure_remote_target() {
        let url = Url::parse("adatcp;target=201(adatcps://db.example.com:60001)").unwrap();
        assert_eq!(url.scheme, Scheme::SecureNetwork);
    }

    #[test]
    fn unknown_option_names_the_key() {
        let err = Url::parse("acj;target=24;nope=1").unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownOption {
                key: "nope".to_string()
            }
        );
    }

    #[test]
    fn inmap_conflicts_with_target() {
        let err = Url::parse("acj;target=24;inmap=24").unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingOptions { .. }));
    }

    #[test]
    fn quoted_values_accepted() {
        let url = Url::parse("acj;target=24;user='batch01'").unwrap();
        assert_eq!(url.user.as_deref(), Some("batch01"));
    }

    #[test]
    fn serialisation_round_trips() {
        for text in [
            "acj;target=24",
            "acj;map;config=[24,4]",
            "acj;map=EmployeeMap;config=[24,4]",
            "adatcp;target=201(adatcp://db.example.com:60001)",
            "acj;inmap=24",
            "acj;target=24;auth=DEFAULT;id=4;user=batch01",
        ] {
            let parsed = Url::parse(text).unwrap();
            let re_parsed = Url::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, re_parsed, "url {text}");
        }
    }

    #[test]
    fn missing_target_rejected() {
        assert!(matches!(
            Url::parse("acj;user=x"),
            Err(ConfigError::MalformedUrl { .. })
        ));
    }
}
