use log::{info, warn};

use crate::error::{IngestError, Result};
use crate::provision::UnitProvisioner;
use crate::publish::PublishOutcome;
use crate::state::AllocatorState;

/// Outcome of the capacity check for one artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The artifact fits in the current unit
    Current,
    /// The current unit would overflow; a new unit is needed
    Rotate,
}

/// Unit chosen for an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub unit_id: String,
    /// True when the unit was created for this artifact
    pub provisioned: bool,
}

/// Greedy fit against the current unit only. Older units are never backfilled
/// and an artifact is never split.
///
/// An empty current unit is always reused: an artifact larger than the
/// ceiling would not fit in any other fresh unit either.
pub fn decide(state: &AllocatorState, candidate_bytes: u64, ceiling: u64) -> Result<Placement> {
    let current = state.current_unit().ok_or_else(|| {
        IngestError::StateInvariant(format!("current unit {} is not registered", state.current_unit_id))
    })?;

    if current.is_empty() {
        return Ok(Placement::Current);
    }

    if current.used_bytes.saturating_add(candidate_bytes) > ceiling {
        Ok(Placement::Rotate)
    } else {
        Ok(Placement::Current)
    }
}

/// Pick the unit for an artifact, provisioning and switching to a new unit
/// when the current one would overflow.
pub async fn select_unit(
    state: &mut AllocatorState,
    candidate_bytes: u64,
    ceiling: u64,
    provisioner: &UnitProvisioner,
) -> Result<Allocation> {
    match decide(state, candidate_bytes, ceiling)? {
        Placement::Current => {
            if candidate_bytes > ceiling {
                warn!(
                    "Artifact of {} bytes exceeds the {} byte ceiling on its own; placing it in empty unit {}",
                    candidate_bytes, ceiling, state.current_unit_id
                );
            }
            Ok(Allocation {
                unit_id: state.current_unit_id.clone(),
                provisioned: false,
            })
        }
        Placement::Rotate => {
            let unit_id = provisioner.provision(state).await?;
            info!(
                "Rotating current unit {} -> {} ({} bytes would not fit)",
                state.current_unit_id, unit_id, candidate_bytes
            );
            state.current_unit_id = unit_id.clone();
            Ok(Allocation {
                unit_id,
                provisioned: true,
            })
        }
    }
}

/// Unit the journal says already holds `key`, if that unit is still registered.
/// A replayed job goes back there instead of through the capacity check, whose
/// counters already include it.
pub fn journaled_unit(state: &AllocatorState, key: &str) -> Option<String> {
    state
        .published
        .get(key)
        .filter(|unit_id| state.units.contains_key(unit_id.as_str()))
        .cloned()
}

/// Account for a successfully published artifact on the unit it went to
pub fn credit(state: &mut AllocatorState, unit_id: &str, bytes: u64) -> Result<()> {
    let unit = state.units.get_mut(unit_id).ok_or_else(|| {
        IngestError::StateInvariant(format!("cannot credit unknown unit {}", unit_id))
    })?;
    unit.used_bytes += bytes;
    unit.file_count += 1;
    Ok(())
}

/// Credit a publish, recording which unit now holds `key`. A replay that
/// found the files already in the unit the journal points at is not
/// credited again. Returns whether the unit was credited.
pub fn credit_publish(
    state: &mut AllocatorState,
    key: &str,
    unit_id: &str,
    bytes: u64,
    outcome: PublishOutcome,
) -> Result<bool> {
    let replay = outcome == PublishOutcome::AlreadyPresent
        && state.published.get(key).map(String::as_str) == Some(unit_id);
    if !replay {
        credit(state, unit_id, bytes)?;
    }
    state.published.insert(key.to_string(), unit_id.to_string());
    Ok(!replay)
}
