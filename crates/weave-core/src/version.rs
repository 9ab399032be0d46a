//! Per-site version vectors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::atom::{AtomId, SiteId};

/// `SiteId → highest timestamp seen from that site`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteVersion {
    sites: BTreeMap<SiteId, u64>,
}

impl SiteVersion {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest timestamp recorded for `site`, if any.
    #[must_use]
    pub fn get(&self, site: SiteId) -> Option<u64> {
        self.sites.get(&site).copied()
    }

    /// Record an observed atom, keeping the maximum timestamp per site.
    pub fn observe(&mut self, id: &AtomId) {
        self.raise(id.site, id.timestamp);
    }

    /// Raise the entry for `site` to at least `timestamp`.
    pub fn raise(&mut self, site: SiteId, timestamp: u64) {
        let entry = self.sites.entry(site).or_insert(timestamp);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    /// Returns `true` if an atom with this id is at or below the recorded version.
    #[must_use]
    pub fn covers(&self, id: &AtomId) -> bool {
        self.get(id.site).is_some_and(|ts| id.timestamp <= ts)
    }

    /// Pointwise maximum with another version.
    pub fn merge(&mut self, other: &Self) {
        for (&site, &ts) in &other.sites {
            self.raise(site, ts);
        }
    }

    /// Pointwise minimum over the sites present in `self`.
    ///
    /// Sites missing from `other` drop to zero.
    #[must_use]
    pub fn meet(&self, other: &Self) -> Self {
        let sites = self
            .sites
            .iter()
            .map(|(&site, &ts)| (site, ts.min(other.get(site).unwrap_or(0))))
            .collect();
        Self { sites }
    }

    /// Known sites in ascending order.
    pub fn sites(&self) -> impl Iterator<Item = SiteId> + '_ {
        self.sites.keys().copied()
    }

    /// `(site, timestamp)` pairs in ascending site order.
    pub fn iter(&self) -> impl Iterator<Item = (SiteId, u64)> + '_ {
        self.sites.iter().map(|(&s, &t)| (s, t))
    }

    /// The largest timestamp over all sites (the Lamport horizon).
    #[must_use]
    pub fn max_timestamp(&self) -> u64 {
        self.sites.values().copied().max().unwrap_or(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl FromIterator<(SiteId, u64)> for SiteVersion {
    fn from_iter<I: IntoIterator<Item = (SiteId, u64)>>(iter: I) -> Self {
        let mut version = Self::new();
        for (site, ts) in iter {
            version.raise(site, ts);
        }
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_keeps_maximum() {
        let mut v = SiteVersion::new();
        v.observe(&AtomId::new(SiteId(1), 5, 0));
        v.observe(&AtomId::new(SiteId(1), 3, 0));
        assert_eq!(v.get(SiteId(1)), Some(5));
    }

    #[test]
    fn covers_checks_site_and_timestamp() {
        let v: SiteVersion = [(SiteId(1), 4)].into_iter().collect();
        assert!(v.covers(&AtomId::new(SiteId(1), 4, 0)));
        assert!(!v.covers(&AtomId::new(SiteId(1), 5, 0)));
        assert!(!v.covers(&AtomId::new(SiteId(2), 1, 0)));
    }

    #[test]
    fn merge_and_meet() {
        let a: SiteVersion = [(SiteId(1), 4), (SiteId(2), 9)].into_iter().collect();
        let b: SiteVersion = [(SiteId(1), 6)].into_iter().collect();

        let mut joined = a.clone();
        joined.merge(&b);
        assert_eq!(joined.get(SiteId(1)), Some(6));
        assert_eq!(joined.get(SiteId(2)), Some(9));

        let met = a.meet(&b);
        assert_eq!(met.get(SiteId(1)), Some(4));
        assert_eq!(met.get(SiteId(2)), Some(0));
    }

    #[test]
    fn serializes_as_plain_map() {
        let v: SiteVersion = [(SiteId(3), 7)].into_iter().collect();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"3":7}"#);
        let back: SiteVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
