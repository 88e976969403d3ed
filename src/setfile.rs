//! Tuning-data tables and per-instance load/apply sequencing.
//!
//! Blob contents are opaque: the core only decides *when* each IP is told to
//! load, apply and delete them. Tables are immutable once built and may be shared
//! (via `Arc`) between instances on the same sensor position; the applied
//! scenario is tracked per instance by [`SetfileBinding`].

use crate::mask::{SlotId, SlotMask};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Physical sensor a stream is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorPosition(pub u8);

impl fmt::Display for SensorPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sensor{}", self.0)
    }
}

/// Tuning parameters of one IP for one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetfileBlob {
    /// Slot the blob is for.
    pub slot: SlotId,
    /// Scenario id.
    pub scenario: u32,
    /// Opaque payload.
    pub data: Bytes,
}

/// Immutable per-sensor table of tuning blobs keyed by slot and scenario.
#[derive(Debug, Clone, Default)]
pub struct SetfileTable {
    position: SensorPosition,
    blobs: BTreeMap<(SlotId, u32), SetfileBlob>,
}

impl SetfileTable {
    /// Empty table for `position`.
    pub fn new(position: SensorPosition) -> Self {
        Self {
            position,
            blobs: BTreeMap::new(),
        }
    }

    /// Builder: add a blob.
    pub fn with_blob(mut self, slot: SlotId, scenario: u32, data: impl Into<Bytes>) -> Self {
        self.blobs.insert(
            (slot, scenario),
            SetfileBlob {
                slot,
                scenario,
                data: data.into(),
            },
        );
        self
    }

    /// Sensor this table belongs to.
    pub fn position(&self) -> SensorPosition {
        self.position
    }

    /// Blob for `slot` under `scenario`.
    pub fn blob(&self, slot: SlotId, scenario: u32) -> Option<&SetfileBlob> {
        self.blobs.get(&(slot, scenario))
    }

    /// True if any slot has data for `scenario`.
    pub fn has_scenario(&self, scenario: u32) -> bool {
        self.blobs.keys().any(|(_, s)| *s == scenario)
    }

    /// Number of blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True when the table holds nothing.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// Setfile sequencing state of one instance.
#[derive(Debug, Clone, Default)]
pub struct SetfileBinding {
    table: Option<Arc<SetfileTable>>,
    scenario: u32,
    loaded: SlotMask,
    applied: bool,
}

impl SetfileBinding {
    /// Binding for `table` starting at `scenario`.
    pub fn new(table: Option<Arc<SetfileTable>>, scenario: u32) -> Self {
        Self {
            table,
            scenario,
            loaded: SlotMask::empty(),
            applied: false,
        }
    }

    /// Shared table, if any.
    pub fn table(&self) -> Option<&Arc<SetfileTable>> {
        self.table.as_ref()
    }

    /// Currently selected scenario.
    pub fn scenario(&self) -> u32 {
        self.scenario
    }

    /// Slots that were told to load data.
    pub fn loaded(&self) -> SlotMask {
        self.loaded
    }

    /// Blobs to load for `slots` under the current scenario.
    pub fn pending_loads(&self, slots: SlotMask) -> Vec<SetfileBlob> {
        let Some(table) = &self.table else {
            return Vec::new();
        };
        slots
            .iter()
            .filter_map(|slot| table.blob(slot, self.scenario).cloned())
            .collect()
    }

    /// Record a successful load on `slot`.
    pub fn mark_loaded(&mut self, slot: SlotId) {
        self.loaded.insert(slot);
        self.applied = false;
    }

    /// True when loaded data has not been applied yet.
    pub fn needs_apply(&self) -> bool {
        !self.applied && !self.loaded.is_empty()
    }

    /// Record that every loaded slot applied the current scenario.
    pub fn mark_applied(&mut self) {
        self.applied = true;
    }

    /// Switch scenario. Returns true when it changed, in which case loaded data
    /// must be reloaded and reapplied.
    pub fn select(&mut self, scenario: u32) -> bool {
        if scenario == self.scenario {
            return false;
        }
        self.scenario = scenario;
        self.applied = false;
        true
    }

    /// Forget loaded slots; returns them for `delete_setfile`.
    pub fn take_loaded(&mut self) -> SlotMask {
        self.applied = false;
        std::mem::take(&mut self.loaded)
    }
}
