//! Economable identities
//!
//! An economable is anything with a tracked balance. It is identified by a
//! namespaced key of the form `<namespace>:<id>`, for example
//! `player:0b6f1a5e-...` or `faction:red`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::LedgerError;

/// Namespace used for player economables.
pub const PLAYER_NAMESPACE: &str = "player";
/// Namespace used for faction economables.
pub const FACTION_NAMESPACE: &str = "faction";
/// Namespace used for any other non-player economable.
pub const GENERIC_NAMESPACE: &str = "generic";

/// The kind of entity behind an economable key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EconomableKind {
    Player,
    Faction,
    Generic,
}

impl EconomableKind {
    fn from_namespace(namespace: &str) -> Option<Self> {
        match namespace {
            PLAYER_NAMESPACE => Some(EconomableKind::Player),
            FACTION_NAMESPACE => Some(EconomableKind::Faction),
            GENERIC_NAMESPACE => Some(EconomableKind::Generic),
            _ => None,
        }
    }
}

/// Validated, immutable economable key
///
/// The key is the only identity an account has. Two economables are equal
/// exactly when their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Economable {
    key: String,
    split: usize,
}

impl Economable {
    /// Parse and validate an economable key
    ///
    /// Player ids may be written in any form a UUID parser accepts; the key
    /// is stored in the lowercase hyphenated form, so every spelling of one
    /// player names the same account.
    ///
    /// # Returns
    ///
    /// * `Ok(Economable)` for a key in a known namespace with a non-empty id
    /// * `Err(LedgerError::UnknownEconomable)` otherwise
    pub fn parse(key: &str) -> Result<Self, LedgerError> {
        let split = key
            .find(':')
            .ok_or_else(|| LedgerError::unknown_economable(key))?;
        let (namespace, id) = (&key[..split], &key[split + 1..]);

        let kind = EconomableKind::from_namespace(namespace)
            .ok_or_else(|| LedgerError::unknown_economable(key))?;

        if id.is_empty() {
            return Err(LedgerError::unknown_economable(key));
        }

        // Player ids must be UUIDs so they can be carried over the sync relay
        if kind == EconomableKind::Player {
            return Uuid::parse_str(id)
                .map(Economable::player)
                .map_err(|_| LedgerError::unknown_economable(key));
        }

        Ok(Economable {
            key: key.to_string(),
            split,
        })
    }

    /// Economable for a player UUID
    pub fn player(uuid: Uuid) -> Self {
        let key = format!("{}:{}", PLAYER_NAMESPACE, uuid);
        Economable {
            split: PLAYER_NAMESPACE.len(),
            key,
        }
    }

    /// Economable for a faction name
    pub fn faction(name: &str) -> Result<Self, LedgerError> {
        Self::parse(&format!("{}:{}", FACTION_NAMESPACE, name))
    }

    /// Economable for a generic, non-player entity
    pub fn generic(id: &str) -> Result<Self, LedgerError> {
        Self::parse(&format!("{}:{}", GENERIC_NAMESPACE, id))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn namespace(&self) -> &str {
        &self.key[..self.split]
    }

    pub fn id(&self) -> &str {
        &self.key[self.split + 1..]
    }

    pub fn kind(&self) -> EconomableKind {
        // Only validated keys are ever constructed
        EconomableKind::from_namespace(self.namespace()).unwrap_or(EconomableKind::Generic)
    }

    /// The player UUID, if this economable is a player
    pub fn player_uuid(&self) -> Option<Uuid> {
        match self.kind() {
            EconomableKind::Player => Uuid::parse_str(self.id()).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Economable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl FromStr for Economable {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Economable::parse(s)
    }
}

impl TryFrom<String> for Economable {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Economable::parse(&value)
    }
}

impl From<Economable> for String {
    fn from(value: Economable) -> Self {
        value.key
    }
}
