//! Stops and zones.
//!
//! A stop is a named group of zones. Each zone covers a continuous key range
//! and sounds one or more ranks together; a mixture is a zone with several
//! ranks.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::rankwave::RankBank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopType {
    #[default]
    Unknown,
    Principal,
    Flute,
    Reed,
    String,
}

impl StopType {
    /// Parse a type name, ignoring case. Unrecognised names map to
    /// [`StopType::Unknown`].
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "principal" => StopType::Principal,
            "flute" => StopType::Flute,
            "reed" => StopType::Reed,
            "string" => StopType::String,
            _ => StopType::Unknown,
        }
    }
}

impl fmt::Display for StopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopType::Unknown => "unknown",
            StopType::Principal => "principal",
            StopType::Flute => "flute",
            StopType::Reed => "reed",
            StopType::String => "string",
        };
        f.write_str(s)
    }
}

/// Key range plus the ranks sounding in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub low: u8,
    pub high: u8,
    pub ranks: Vec<usize>,
}

impl Zone {
    pub fn new(low: u8, high: u8, ranks: Vec<usize>) -> Self {
        Self { low, high, ranks }
    }

    pub fn key_range(&self) -> RangeInclusive<u8> {
        self.low..=self.high
    }

    pub fn covers(&self, note: u8) -> bool {
        self.low <= note && note <= self.high
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub name: String,
    pub kind: StopType,
    pub gain: f32,
    pub chiff_gain: f32,
    zones: Vec<Zone>,
}

impl Stop {
    pub fn new(name: impl Into<String>, kind: StopType) -> Self {
        Self {
            name: name.into(),
            kind,
            gain: 1.0,
            chiff_gain: 0.0,
            zones: Vec::new(),
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Add a zone spanning the union of the ranks' note ranges. Ranks missing
    /// from the bank are skipped; nothing is added if none remain.
    pub fn add_zone(&mut self, bank: &RankBank, ranks: &[usize]) {
        let mut range: Option<(u8, u8)> = None;
        let mut kept = Vec::with_capacity(ranks.len());
        for &id in ranks {
            let Some(rank) = bank.get(id) else {
                continue;
            };
            range = Some(match range {
                Some((lo, hi)) => (lo.min(rank.note_min()), hi.max(rank.note_max())),
                None => (rank.note_min(), rank.note_max()),
            });
            kept.push(id);
        }
        if let Some((low, high)) = range {
            self.zones.push(Zone::new(low, high, kept));
        }
    }

    /// Add a zone with an explicit key range.
    pub fn add_zone_with_range(&mut self, low: u8, high: u8, ranks: Vec<usize>) {
        if !ranks.is_empty() && low <= high {
            self.zones.push(Zone::new(low, high, ranks));
        }
    }

    /// Union of all zone ranges.
    pub fn key_range(&self) -> Option<RangeInclusive<u8>> {
        let low = self.zones.iter().map(|z| z.low).min()?;
        let high = self.zones.iter().map(|z| z.high).max()?;
        Some(low..=high)
    }

    pub fn covers(&self, note: u8) -> bool {
        self.zones.iter().any(|z| z.covers(note))
    }

    /// Ranks sounding for `note`, across every zone that covers it.
    pub fn ranks_for(&self, note: u8) -> impl Iterator<Item = usize> + '_ {
        self.zones
            .iter()
            .filter(move |z| z.covers(note))
            .flat_map(|z| z.ranks.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelRegistry, PipeModel};
    use std::sync::Arc;

    fn bank() -> RankBank {
        let reg = ModelRegistry::builtin();
        let mut bank = RankBank::new(0);
        bank.add(Arc::clone(reg.get("Principal 8").expect("builtin")));
        let mut treble = PipeModel::new("Cornet");
        treble.set_note_range(60, 96).expect("range");
        bank.add(Arc::new(treble));
        bank
    }

    #[test]
    fn type_names_parse_case_insensitively() {
        assert_eq!(StopType::from_name("Principal"), StopType::Principal);
        assert_eq!(StopType::from_name("REED"), StopType::Reed);
        assert_eq!(StopType::from_name("bombarde"), StopType::Unknown);
        assert_eq!(StopType::Flute.to_string(), "flute");
    }

    #[test]
    fn zone_range_is_union_of_ranks() {
        let bank = bank();
        let mut stop = Stop::new("Cornet", StopType::Flute);
        stop.add_zone(&bank, &[1, 0, 7]);
        assert_eq!(stop.zones().len(), 1);
        assert_eq!(stop.zones()[0].ranks, vec![1, 0]);
        assert_eq!(stop.key_range(), Some(36..=96));
    }

    #[test]
    fn ranks_for_walks_covering_zones() {
        let mut stop = Stop::new("Split", StopType::Unknown);
        stop.add_zone_with_range(36, 59, vec![0]);
        stop.add_zone_with_range(60, 96, vec![1, 2]);
        stop.add_zone_with_range(50, 70, vec![3]);

        assert_eq!(stop.ranks_for(40).collect::<Vec<_>>(), vec![0]);
        assert_eq!(stop.ranks_for(55).collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(stop.ranks_for(65).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(stop.ranks_for(20).count(), 0);
        assert!(!stop.covers(97));
    }

    #[test]
    fn empty_zones_are_ignored() {
        let mut stop = Stop::new("None", StopType::Unknown);
        stop.add_zone(&RankBank::new(0), &[0]);
        stop.add_zone_with_range(60, 50, vec![0]);
        assert!(stop.zones().is_empty());
        assert_eq!(stop.key_range(), None);
    }
}
