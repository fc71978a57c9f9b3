//! Rank-keyed storage for one user's connections to one provider.

use crate::connection::ConnectionData;
use crate::error::{ConnectError, Result};
use crate::repository::validate_rank;
use std::collections::BTreeMap;
use tracing::debug;

/// Connections of a single (user, provider) scope, ordered by rank.
///
/// Invariant: no two entries share a `provider_user_id`.
#[derive(Debug, Clone)]
pub struct ProviderConnections {
    user_id: String,
    provider_id: String,
    by_rank: BTreeMap<u32, ConnectionData>,
}

impl ProviderConnections {
    pub fn new(user_id: &str, provider_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            provider_id: provider_id.to_string(),
            by_rank: BTreeMap::new(),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn len(&self) -> usize {
        self.by_rank.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rank.is_empty()
    }

    /// (rank, data) pairs in ascending rank order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &ConnectionData)> {
        self.by_rank.iter().map(|(rank, data)| (*rank, data))
    }

    /// All records in ascending rank order.
    pub fn find_all(&self) -> Vec<ConnectionData> {
        self.by_rank.values().cloned().collect()
    }

    pub fn find_by_provider_user_id(&self, provider_user_id: &str) -> Option<&ConnectionData> {
        self.by_rank
            .values()
            .find(|data| data.provider_user_id == provider_user_id)
    }

    pub fn find_by_rank(&self, rank: u32) -> Option<&ConnectionData> {
        self.by_rank.get(&rank)
    }

    /// Records whose provider user id is in `provider_user_ids`, ascending rank.
    pub fn find_by_provider_user_ids<S: AsRef<str>>(
        &self,
        provider_user_ids: &[S],
    ) -> Vec<ConnectionData> {
        self.by_rank
            .values()
            .filter(|data| {
                provider_user_ids
                    .iter()
                    .any(|id| id.as_ref() == data.provider_user_id)
            })
            .cloned()
            .collect()
    }

    pub fn has_provider_user_id(&self, provider_user_id: &str) -> bool {
        self.find_by_provider_user_id(provider_user_id).is_some()
    }

    /// `max(existing) + 1`, or 1 for an empty scope.
    pub fn next_rank(&self) -> Result<u32> {
        match self.by_rank.keys().next_back() {
            None => Ok(1),
            Some(max) => max
                .checked_add(1)
                .ok_or_else(|| ConnectError::invalid("no rank left above the current maximum")),
        }
    }

    /// Inserts `data`, at `rank` when given, otherwise at the next rank.
    ///
    /// Fails with `DuplicateConnection` when the provider user id is already
    /// linked in this scope, and with `RankTaken` when an explicit rank is
    /// occupied. Returns the rank the record was stored at.
    pub fn add(&mut self, data: ConnectionData, rank: Option<u32>) -> Result<u32> {
        if data.provider_id != self.provider_id {
            return Err(ConnectError::invalid(format!(
                "connection for provider '{}' cannot be stored under provider '{}'",
                data.provider_id, self.provider_id
            )));
        }
        if self.has_provider_user_id(&data.provider_user_id) {
            return Err(ConnectError::DuplicateConnection(data.key()));
        }

        let rank = match rank {
            Some(rank) => {
                validate_rank(rank)?;
                if self.by_rank.contains_key(&rank) {
                    return Err(ConnectError::RankTaken {
                        provider_id: self.provider_id.clone(),
                        rank,
                    });
                }
                rank
            }
            None => self.next_rank()?,
        };

        debug!(
            user_id = %self.user_id,
            provider_id = %self.provider_id,
            provider_user_id = %data.provider_user_id,
            rank = rank,
            "Adding connection"
        );
        self.by_rank.insert(rank, data);
        Ok(rank)
    }

    /// Replaces the record linked to `provider_user_id`, keeping its rank.
    ///
    /// Returns false (and changes nothing) when no record matches.
    pub fn update(&mut self, data: ConnectionData, provider_user_id: &str) -> bool {
        let Some(rank) = self.rank_of(provider_user_id) else {
            return false;
        };

        debug!(
            user_id = %self.user_id,
            provider_id = %self.provider_id,
            provider_user_id = %provider_user_id,
            rank = rank,
            "Updating connection"
        );
        self.by_rank.insert(rank, data);
        true
    }

    /// Returns false when nothing was linked to `provider_user_id`.
    pub fn remove_by_provider_user_id(&mut self, provider_user_id: &str) -> bool {
        let Some(rank) = self.rank_of(provider_user_id) else {
            return false;
        };

        debug!(
            user_id = %self.user_id,
            provider_id = %self.provider_id,
            provider_user_id = %provider_user_id,
            rank = rank,
            "Removing connection"
        );
        self.by_rank.remove(&rank).is_some()
    }

    pub fn remove_all(&mut self) {
        debug!(
            user_id = %self.user_id,
            provider_id = %self.provider_id,
            count = self.by_rank.len(),
            "Removing all connections"
        );
        self.by_rank.clear();
    }

    fn rank_of(&self, provider_user_id: &str) -> Option<u32> {
        self.by_rank
            .iter()
            .find(|(_, data)| data.provider_user_id == provider_user_id)
            .map(|(rank, _)| *rank)
    }
}
