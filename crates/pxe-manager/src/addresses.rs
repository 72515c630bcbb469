//! Public and private IP address pools.
//!
//! Same claim pattern as hosts without the boot and verification phases: an
//! address is either owned or not, and assigning it cannot fail afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::reservation::ReservationError;
use crate::resources::{AddressResource, Record};
use crate::store::ResourceStore;
use crate::tags::{self, Tags};

/// Reserves addresses from one collection.
pub struct AddressPool {
    name: String,
    store: Arc<dyn ResourceStore<AddressResource>>,
}

impl AddressPool {
    /// Create a pool named `name` (used in logs) over `store`.
    #[must_use]
    pub fn new(name: impl Into<String>, store: Arc<dyn ResourceStore<AddressResource>>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reserve `count` unowned addresses matching `tags` for `owner`.
    ///
    /// All or nothing: if a write fails part way, the addresses already
    /// claimed are handed back before the error is returned.
    ///
    /// # Errors
    /// Returns [`ReservationError::InsufficientTaggedResources`] or
    /// [`ReservationError::InsufficientResources`] when the pool cannot
    /// satisfy the request, and [`ReservationError::StoreUnavailable`] when
    /// the datastore fails.
    pub async fn reserve(
        &self,
        owner: &str,
        count: usize,
        tags: &Tags,
    ) -> Result<Vec<String>, ReservationError> {
        if count == 0 {
            return Err(ReservationError::InvalidRequest("count must be at least 1".into()));
        }
        if owner.is_empty() {
            return Err(ReservationError::InvalidRequest("owner is empty".into()));
        }

        let free = self.store.find_unowned().await?;
        let free_count = free.len();
        let mut candidates: Vec<Record<AddressResource>> = free
            .into_iter()
            .filter(|record| tags::matches(&record.resource.tags, tags))
            .collect();

        if candidates.len() < count {
            return Err(if candidates.len() < free_count {
                ReservationError::InsufficientTaggedResources {
                    requested: count,
                    matching: candidates.len(),
                    idle: free_count,
                }
            } else {
                ReservationError::InsufficientResources {
                    requested: count,
                    available: free_count,
                }
            });
        }
        candidates.shuffle(&mut rand::thread_rng());

        let mut claimed = Vec::with_capacity(count);
        for mut candidate in candidates {
            if claimed.len() == count {
                break;
            }
            let address = candidate.resource.address.clone();
            candidate.resource.owner = owner.to_string();
            match self.store.update(&candidate).await {
                Ok(_) => claimed.push(address),
                Err(e) if e.is_conflict() => {
                    debug!(pool = %self.name, address = %address, "Address already taken");
                }
                Err(e) => {
                    self.roll_back(owner, &claimed).await;
                    return Err(e.into());
                }
            }
        }

        if claimed.len() < count {
            self.roll_back(owner, &claimed).await;
            return Err(ReservationError::InsufficientResources {
                requested: count,
                available: claimed.len(),
            });
        }

        info!(pool = %self.name, owner = %owner, addresses = ?claimed, "Reserved addresses");
        Ok(claimed)
    }

    /// Release every address held by `owner`. Returns how many were reset.
    ///
    /// # Errors
    /// Returns [`ReservationError::StoreUnavailable`] if the datastore fails.
    pub async fn release_owner(&self, owner: &str) -> Result<usize, ReservationError> {
        if owner.is_empty() {
            return Ok(0);
        }
        let owned = self.store.find("owner", owner).await?;
        let mut released = 0;
        for record in owned {
            if self.release_if(&record.resource.address, Some(owner)).await? {
                released += 1;
            }
        }
        info!(pool = %self.name, owner = %owner, released, "Released addresses");
        Ok(released)
    }

    /// Release one address whoever owns it. Returns 1 if it was owned.
    ///
    /// # Errors
    /// Returns [`ReservationError::StoreUnavailable`] if the address does not
    /// exist or the datastore fails.
    pub async fn release_address(&self, address: &str) -> Result<usize, ReservationError> {
        let released = self.release_if(address, None).await?;
        Ok(usize::from(released))
    }

    /// Addresses currently held by `owner`.
    ///
    /// # Errors
    /// Returns [`ReservationError::StoreUnavailable`] if the datastore fails.
    pub async fn owned_by(&self, owner: &str) -> Result<Vec<AddressResource>, ReservationError> {
        Ok(self
            .store
            .find("owner", owner)
            .await?
            .into_iter()
            .map(|record| record.resource)
            .collect())
    }

    /// Clear the owner of `address`, only if it is `owner` when given.
    async fn release_if(&self, address: &str, owner: Option<&str>) -> Result<bool, ReservationError> {
        let applied = AtomicBool::new(false);
        self.store
            .modify(address, &|resource: &mut AddressResource| {
                let ours = resource.is_owned()
                    && owner.map_or(true, |owner| resource.owner == owner);
                if ours {
                    resource.owner.clear();
                }
                applied.store(ours, Ordering::Relaxed);
                ours
            })
            .await?;

        let released = applied.load(Ordering::Relaxed);
        if released {
            debug!(pool = %self.name, address = %address, "Released address");
        }
        Ok(released)
    }

    async fn roll_back(&self, owner: &str, claimed: &[String]) {
        for address in claimed {
            if let Err(e) = self.release_if(address, Some(owner)).await {
                warn!(pool = %self.name, address = %address, error = %e, "Failed to roll back address");
            }
        }
    }
}
