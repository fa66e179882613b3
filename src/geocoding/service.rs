//! Cache-first resolution, provider failover and edit execution.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::runtime::{Builder, Runtime};

use super::cow::{self, EditPlan, LocationEdit, LocationWrite, StayCommand};
use super::provider::{GeocodingProvider, ProviderKind};
use super::{format_coordinates, GeocodingLocation, GeocodingResult, LocationResolver, ResolvedName};
use crate::config::GeocodingConfig;
use crate::store::{EventStore, GeocodingStore};
use crate::{GpsPoint, OptionExt, Result, TimelineError, UserId};

pub struct GeocodingService {
    config: GeocodingConfig,
    providers: Vec<GeocodingProvider>,
    locations: Arc<dyn GeocodingStore>,
    events: Arc<dyn EventStore>,
}

impl GeocodingService {
    pub fn new(
        config: GeocodingConfig,
        locations: Arc<dyn GeocodingStore>,
        events: Arc<dyn EventStore>,
    ) -> Result<Self> {
        let providers = config
            .providers
            .iter()
            .cloned()
            .map(GeocodingProvider::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            providers,
            locations,
            events,
        })
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&GeocodingProvider> {
        self.providers.iter().find(|p| p.kind() == kind)
    }

    /// Primary, then the fallback when it is distinct and enabled.
    fn chain(&self) -> Vec<&GeocodingProvider> {
        let mut chain = Vec::with_capacity(2);
        if let Some(primary) = self.provider(self.config.primary) {
            chain.push(primary);
        }
        if let Some(fallback) = self
            .config
            .fallback
            .filter(|f| *f != self.config.primary)
            .and_then(|f| self.provider(f))
            .filter(|p| p.is_enabled())
        {
            chain.push(fallback);
        }
        chain
    }

    /// Ask the provider chain, bypassing the cache.
    pub async fn reverse_geocode(&self, point: &GpsPoint) -> Result<GeocodingResult> {
        let mut last_error = TimelineError::ProviderUnavailable {
            provider: self.config.primary.name().to_string(),
            message: "no provider configured".to_string(),
        };
        for provider in self.chain() {
            match provider.reverse_geocode(point).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!("[Geocoding] {} failed, trying next provider: {}", provider.kind(), e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Name for `point` as seen by `user`. Never fails.
    ///
    /// Cache hits within the configured radius are reused (the user's own
    /// copy first). A provider result is stored as a new shared original.
    pub async fn resolve(&self, user: Option<UserId>, point: &GpsPoint) -> ResolvedName {
        match self
            .locations
            .find_nearest_location(point, self.config.cache_radius_meters, user)
        {
            Ok(Some(cached)) => {
                debug!("[Geocoding] cache hit {:?} for ({}, {})", cached.id, point.latitude, point.longitude);
                return ResolvedName {
                    name: cached.display_name,
                    geocoding_id: cached.id,
                };
            }
            Ok(None) => {}
            Err(e) => warn!("[Geocoding] cache lookup failed: {}", e),
        }

        let result = match self.reverse_geocode(point).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "[Geocoding] all providers failed for ({}, {}), using coordinates: {}",
                    point.latitude, point.longitude, e
                );
                return ResolvedName {
                    name: format_coordinates(point),
                    geocoding_id: None,
                };
            }
        };

        let name = result.display_name.clone();
        match self
            .locations
            .insert_location(GeocodingLocation::from_result(*point, result, Utc::now()))
        {
            Ok(stored) => ResolvedName {
                name,
                geocoding_id: stored.id,
            },
            Err(e) => {
                warn!("[Geocoding] failed to cache result: {}", e);
                ResolvedName {
                    name,
                    geocoding_id: None,
                }
            }
        }
    }

    fn load(&self, location_id: i64) -> Result<GeocodingLocation> {
        self.locations
            .get_location(location_id)?
            .ok_or_not_found("GeocodingLocation", location_id)
    }

    fn existing_copy(&self, user: UserId, location: &GeocodingLocation) -> Result<Option<GeocodingLocation>> {
        match (location.is_original(), location.id) {
            (true, Some(id)) => self.locations.find_user_copy(user, id),
            _ => Ok(None),
        }
    }

    /// Apply `editor`'s manual edit with copy-on-write semantics.
    ///
    /// Returns the fact the editor now sees.
    pub fn edit_location(
        &self,
        editor: UserId,
        location_id: i64,
        edit: &LocationEdit,
    ) -> Result<GeocodingLocation> {
        let existing = self.load(location_id)?;
        let copy = self.existing_copy(editor, &existing)?;
        let plan = cow::plan_user_edit(&existing, editor, copy.as_ref(), edit, Utc::now())?;
        Ok(self.apply_plan(plan)?.or(copy).unwrap_or(existing))
    }

    /// Re-query the providers for `location_id` on behalf of `user`.
    pub async fn reconcile(&self, user: UserId, location_id: i64) -> Result<GeocodingLocation> {
        let existing = self.load(location_id)?;
        let fresh = self.reverse_geocode(&existing.request_point).await?;
        let copy = self.existing_copy(user, &existing)?;
        let plan = cow::plan_reconciliation(&existing, user, copy.as_ref(), &fresh, Utc::now())?;
        if plan.is_noop() {
            debug!("[Geocoding] reconciliation of {} found no change", location_id);
        }
        Ok(self.apply_plan(plan)?.or(copy).unwrap_or(existing))
    }

    /// Edit a shared original in place for everyone.
    pub fn admin_edit(&self, location_id: i64, edit: &LocationEdit) -> Result<GeocodingLocation> {
        let existing = self.load(location_id)?;
        let plan = cow::plan_admin_edit(&existing, edit, Utc::now())?;
        Ok(self.apply_plan(plan)?.unwrap_or(existing))
    }

    /// Refresh a shared original from the providers for everyone.
    pub async fn admin_reconcile(&self, location_id: i64) -> Result<GeocodingLocation> {
        let existing = self.load(location_id)?;
        let fresh = self.reverse_geocode(&existing.request_point).await?;
        let plan = cow::plan_admin_reconciliation(&existing, &fresh, Utc::now())?;
        Ok(self.apply_plan(plan)?.unwrap_or(existing))
    }

    /// Execute a plan: the row write first, then the stay commands against
    /// the written row. Returns the written row, if any.
    pub fn apply_plan(&self, plan: EditPlan) -> Result<Option<GeocodingLocation>> {
        let written = match plan.write {
            LocationWrite::None => return Ok(None),
            LocationWrite::Insert(location) => self.locations.insert_location(location)?,
            LocationWrite::Update(location) => {
                self.locations.update_location(&location)?;
                location
            }
        };
        let target = written
            .id
            .ok_or_invalid("written geocoding location has no id")?;

        for command in plan.commands {
            match command {
                StayCommand::RepointStays { user, from } => {
                    let moved = self.events.repoint_stays(user, from, target)?;
                    info!("[Geocoding] repointed {} stays of {} from {} to {}", moved, user, from, target);
                }
                StayCommand::RenameStays { user, name } => {
                    let renamed = self.events.rename_stays(user, target, &name)?;
                    debug!("[Geocoding] renamed {} stays referencing {}", renamed, target);
                }
            }
        }
        Ok(Some(written))
    }
}

/// Bridges the async service into the synchronous timeline pipeline.
///
/// Owns a current-thread runtime; must not be called from inside another
/// tokio runtime.
pub struct BlockingResolver {
    runtime: Runtime,
    service: Arc<GeocodingService>,
}

impl BlockingResolver {
    pub fn new(service: Arc<GeocodingService>) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TimelineError::ProviderUnavailable {
                provider: "runtime".to_string(),
                message: format!("failed to create tokio runtime: {}", e),
            })?;
        Ok(Self { runtime, service })
    }
}

impl LocationResolver for BlockingResolver {
    fn resolve_name(&self, user: UserId, point: &GpsPoint) -> ResolvedName {
        self.runtime.block_on(self.service.resolve(Some(user), point))
    }
}
