//! Nix store paths.
//!
//! Only the hash part identifies an entry inside a cache; the name is kept
//! for display and for narinfo rendering.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

pub const STORE_DIR: &str = "/nix/store";

const HASH_LEN: usize = 32;

fn is_nix_base32(c: char) -> bool {
    // 0-9 and a-z without e, o, u, t
    matches!(c, '0'..='9' | 'a'..='d' | 'f'..='n' | 'p'..='s' | 'v'..='z')
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.' | '_' | '?' | '=')
}

/// The 32-character nix-base32 digest at the front of a store path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathHash(String);

impl StorePathHash {
    pub fn new(hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into();
        if hash.len() != HASH_LEN {
            return Err(Error::InvalidStorePath(format!(
                "store path hash must be {HASH_LEN} chars, got {}",
                hash.len()
            )));
        }
        if let Some(c) = hash.chars().find(|c| !is_nix_base32(*c)) {
            return Err(Error::InvalidStorePath(format!(
                "invalid character in store path hash: {c:?}"
            )));
        }
        Ok(Self(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePathHash({})", self.0)
    }
}

impl fmt::Display for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StorePathHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// A full store path, `/nix/store/<hash>-<name>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    hash: StorePathHash,
    name: String,
}

impl StorePath {
    /// Parse an absolute store path.
    pub fn parse(path: &str) -> Result<Self> {
        let basename = path
            .strip_prefix(STORE_DIR)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| Error::InvalidStorePath(format!("must start with {STORE_DIR}/")))?;
        Self::from_basename(basename)
    }

    /// Parse the `<hash>-<name>` part on its own.
    pub fn from_basename(basename: &str) -> Result<Self> {
        if !basename.is_ascii() {
            return Err(Error::InvalidStorePath(
                "store path contains non-ASCII characters".into(),
            ));
        }
        if basename.len() < HASH_LEN + 2 {
            return Err(Error::InvalidStorePath("path too short".into()));
        }

        let (hash, rest) = basename.split_at(HASH_LEN);
        let name = rest
            .strip_prefix('-')
            .ok_or_else(|| Error::InvalidStorePath("expected '-' after hash".into()))?;
        Self::new(StorePathHash::new(hash)?, name)
    }

    pub fn new(hash: StorePathHash, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > 211 {
            return Err(Error::InvalidStorePath(format!(
                "name length {} out of range",
                name.len()
            )));
        }
        if name.starts_with('.') {
            return Err(Error::InvalidStorePath("name cannot start with '.'".into()));
        }
        if let Some(c) = name.chars().find(|c| !is_name_char(*c)) {
            return Err(Error::InvalidStorePath(format!(
                "invalid character in name: {c:?}"
            )));
        }
        Ok(Self { hash, name })
    }

    pub fn hash(&self) -> &StorePathHash {
        &self.hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn basename(&self) -> String {
        format!("{}-{}", self.hash, self.name)
    }

    pub fn to_path_string(&self) -> String {
        format!("{STORE_DIR}/{}-{}", self.hash, self.name)
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePath({})", self.to_path_string())
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{STORE_DIR}/{}-{}", self.hash, self.name)
    }
}

impl FromStr for StorePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for StorePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StorePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
