//! Copy-on-write planning for geocoding facts.
//!
//! Every function here is pure: it inspects the current fact and returns
//! an [`EditPlan`] describing the single row write and the stay updates
//! that must follow it. [`GeocodingService`](super::GeocodingService)
//! executes the plan against storage.
//!
//! Rules:
//! - editing your own copy updates it in place
//! - editing a shared original creates (or reuses) your copy, leaves the
//!   original untouched and repoints your stays to the copy
//! - editing another user's copy is refused
//! - a change that leaves the data identical is a no-op

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{GeocodingLocation, GeocodingResult};
use crate::{OptionExt, Result, TimelineError, UserId};

/// Manual edit of a fact's descriptive fields. `None` keeps the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationEdit {
    pub display_name: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

impl LocationEdit {
    pub fn rename(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            ..Self::default()
        }
    }

    fn apply(&self, location: &GeocodingLocation, now: DateTime<Utc>) -> GeocodingLocation {
        let mut edited = location.clone();
        if let Some(name) = &self.display_name {
            edited.display_name = name.clone();
        }
        if let Some(city) = &self.city {
            edited.city = Some(city.clone());
        }
        if let Some(country) = &self.country {
            edited.country = Some(country.clone());
        }
        edited.updated_at = now;
        edited
    }
}

/// The one row write of a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationWrite {
    None,
    Insert(GeocodingLocation),
    Update(GeocodingLocation),
}

/// Stay updates executed after the row write. Both refer to the written
/// row's id.
#[derive(Debug, Clone, PartialEq)]
pub enum StayCommand {
    /// Point `user`'s stays that reference `from` at the written row
    RepointStays { user: UserId, from: i64 },
    /// Rewrite denormalized names of stays referencing the written row;
    /// `user: None` touches every user's stays
    RenameStays { user: Option<UserId>, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditPlan {
    pub write: LocationWrite,
    pub commands: Vec<StayCommand>,
}

impl EditPlan {
    pub fn noop() -> Self {
        Self {
            write: LocationWrite::None,
            commands: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.write == LocationWrite::None && self.commands.is_empty()
    }
}

/// Plan a user's manual edit of `existing`.
///
/// `existing_copy` is the copy `editor` already owns of `existing` when
/// `existing` is an original.
pub fn plan_user_edit(
    existing: &GeocodingLocation,
    editor: UserId,
    existing_copy: Option<&GeocodingLocation>,
    edit: &LocationEdit,
    now: DateTime<Utc>,
) -> Result<EditPlan> {
    plan_change(existing, editor, existing_copy, |loc| edit.apply(loc, now))
}

/// Plan applying a fresh provider result to `existing` on behalf of `user`.
pub fn plan_reconciliation(
    existing: &GeocodingLocation,
    user: UserId,
    existing_copy: Option<&GeocodingLocation>,
    fresh: &GeocodingResult,
    now: DateTime<Utc>,
) -> Result<EditPlan> {
    plan_change(existing, user, existing_copy, |loc| loc.with_result(fresh, now))
}

/// Plan an administrative edit of a shared original: updated in place,
/// names propagated to every user's stays.
pub fn plan_admin_edit(
    existing: &GeocodingLocation,
    edit: &LocationEdit,
    now: DateTime<Utc>,
) -> Result<EditPlan> {
    plan_admin_change(existing, |loc| edit.apply(loc, now))
}

/// Plan the bulk-reconciliation update of a shared original.
pub fn plan_admin_reconciliation(
    existing: &GeocodingLocation,
    fresh: &GeocodingResult,
    now: DateTime<Utc>,
) -> Result<EditPlan> {
    plan_admin_change(existing, |loc| loc.with_result(fresh, now))
}

fn plan_change(
    existing: &GeocodingLocation,
    user: UserId,
    existing_copy: Option<&GeocodingLocation>,
    change: impl Fn(&GeocodingLocation) -> GeocodingLocation,
) -> Result<EditPlan> {
    let existing_id = existing
        .id
        .ok_or_invalid("geocoding location has not been persisted")?;

    match existing.user_id {
        Some(owner) if owner != user => Err(TimelineError::PermissionDenied(format!(
            "geocoding location {} belongs to another user",
            existing_id
        ))),
        Some(_) => {
            let updated = change(existing);
            if updated.same_data(existing) {
                return Ok(EditPlan::noop());
            }
            let mut commands = Vec::new();
            if updated.display_name != existing.display_name {
                commands.push(StayCommand::RenameStays {
                    user: Some(user),
                    name: updated.display_name.clone(),
                });
            }
            Ok(EditPlan {
                write: LocationWrite::Update(updated),
                commands,
            })
        }
        None => {
            let base = existing_copy
                .filter(|copy| copy.is_owned_by(user) && copy.source_id == Some(existing_id));
            let target = change(base.unwrap_or(existing));
            if target.same_data(base.unwrap_or(existing)) {
                return Ok(EditPlan::noop());
            }

            let write = match base {
                Some(_) => LocationWrite::Update(target.clone()),
                None => LocationWrite::Insert(GeocodingLocation {
                    id: None,
                    user_id: Some(user),
                    source_id: Some(existing_id),
                    created_at: target.updated_at,
                    ..target.clone()
                }),
            };
            Ok(EditPlan {
                write,
                commands: vec![
                    StayCommand::RepointStays {
                        user,
                        from: existing_id,
                    },
                    StayCommand::RenameStays {
                        user: Some(user),
                        name: target.display_name,
                    },
                ],
            })
        }
    }
}

fn plan_admin_change(
    existing: &GeocodingLocation,
    change: impl Fn(&GeocodingLocation) -> GeocodingLocation,
) -> Result<EditPlan> {
    existing
        .id
        .ok_or_invalid("geocoding location has not been persisted")?;
    if !existing.is_original() {
        return Err(TimelineError::InvalidInput(
            "administrative edits apply to shared originals only".to_string(),
        ));
    }

    let updated = change(existing);
    if updated.same_data(existing) {
        return Ok(EditPlan::noop());
    }
    let mut commands = Vec::new();
    if updated.display_name != existing.display_name {
        commands.push(StayCommand::RenameStays {
            user: None,
            name: updated.display_name.clone(),
        });
    }
    Ok(EditPlan {
        write: LocationWrite::Update(updated),
        commands,
    })
}
