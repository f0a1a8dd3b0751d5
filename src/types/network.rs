//! Directory of known motes and its JSON network file.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::mote::Mote;

/// Known motes, at most one per address, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    motes: Vec<Mote>,
}

impl Network {
    /// Creates an empty network.
    #[must_use]
    pub const fn new() -> Self {
        Self { motes: Vec::new() }
    }

    /// Reads a network file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut network: Self = serde_json::from_str(&content)?;
        network.dedup();
        Ok(network)
    }

    /// Reads a network file, starting empty if it does not exist yet.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        match Self::load(path) {
            Err(Error::Transport(e)) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            other => other,
        }
    }

    /// Writes the network file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Number of motes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.motes.len()
    }

    /// True if no mote is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.motes.is_empty()
    }

    /// Motes in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &Mote> {
        self.motes.iter()
    }

    /// Looks up a mote by address.
    #[must_use]
    pub fn get(&self, address: u8) -> Option<&Mote> {
        self.motes.iter().find(|m| m.address == address)
    }

    /// Looks up a mote by address for update.
    pub fn get_mut(&mut self, address: u8) -> Option<&mut Mote> {
        self.motes.iter_mut().find(|m| m.address == address)
    }

    /// True if a mote with this address is known.
    #[must_use]
    pub fn contains(&self, address: u8) -> bool {
        self.get(address).is_some()
    }

    /// Adds a mote, or refreshes the one already at its address.
    ///
    /// A rediscovered mote keeps its registers and state; only its security
    /// option, nonce and last-seen time are taken from `mote`. Returns true
    /// if the mote is new.
    pub fn add_or_update(&mut self, mote: Mote) -> bool {
        if let Some(known) = self.get_mut(mote.address) {
            known.security = mote.security;
            known.nonce = mote.nonce;
            known.last_seen = mote.last_seen.or(known.last_seen);
            false
        } else {
            self.motes.push(mote);
            true
        }
    }

    /// Moves a mote to a new address, keeping everything else.
    ///
    /// Returns false if no mote lives at `old`. Fails if `new` is taken.
    pub fn change_address(&mut self, old: u8, new: u8) -> Result<bool> {
        if old == new {
            return Ok(self.contains(old));
        }
        if self.contains(new) {
            return Err(Error::InvalidValue {
                reason: format!("address {new} already belongs to another mote"),
            });
        }
        Ok(self.get_mut(old).map(|mote| mote.address = new).is_some())
    }

    /// Forgets every mote.
    pub fn clear(&mut self) {
        self.motes.clear();
    }

    fn dedup(&mut self) {
        let mut seen = [false; 256];
        self.motes.retain(|m| {
            let first = !seen[usize::from(m.address)];
            seen[usize::from(m.address)] = true;
            if !first {
                tracing::warn!("dropping duplicate mote at address {}", m.address);
            }
            first
        });
    }
}

impl<'a> IntoIterator for &'a Network {
    type Item = &'a Mote;
    type IntoIter = std::slice::Iter<'a, Mote>;

    fn into_iter(self) -> Self::IntoIter {
        self.motes.iter()
    }
}
