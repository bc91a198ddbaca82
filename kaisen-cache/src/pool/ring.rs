//! Key to endpoint mapping.
//!
//! The continuum is rebuilt on every topology change and swapped in whole;
//! callers work on an immutable `Arc` snapshot.

use super::endpoint::Endpoint;
use kaisen_core::{KeyDistribution, KETAMA_POINTS_PER_WEIGHT};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// 32-bit key hash used for both distributions.
pub(crate) fn hash_key(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug)]
pub(crate) struct Continuum {
    distribution: KeyDistribution,
    endpoints: Vec<Arc<Endpoint>>,
    /// Ketama points `(hash, endpoint index)` sorted by hash.
    points: Vec<(u32, usize)>,
    /// Modulo buckets, each endpoint repeated `weight` times.
    buckets: Vec<usize>,
}

impl Continuum {
    pub(crate) fn empty(distribution: KeyDistribution) -> Self {
        Self::build(distribution, Vec::new())
    }

    pub(crate) fn build(distribution: KeyDistribution, endpoints: Vec<Arc<Endpoint>>) -> Self {
        let mut points = Vec::new();
        let mut buckets = Vec::new();

        match distribution {
            KeyDistribution::Ketama => {
                for (idx, endpoint) in endpoints.iter().enumerate() {
                    // Four points per digest.
                    let digests = KETAMA_POINTS_PER_WEIGHT.saturating_mul(endpoint.weight()) / 4;
                    for i in 0..digests {
                        let digest = Sha256::digest(format!("{}-{}", endpoint.address(), i));
                        for chunk in digest[..16].chunks_exact(4) {
                            let hash = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                            points.push((hash, idx));
                        }
                    }
                }
                points.sort_unstable();
            }
            KeyDistribution::Modulo => {
                for (idx, endpoint) in endpoints.iter().enumerate() {
                    buckets.extend(std::iter::repeat(idx).take(endpoint.weight() as usize));
                }
            }
        }

        Self {
            distribution,
            endpoints,
            points,
            buckets,
        }
    }

    pub(crate) fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// The endpoint a key maps to, ignoring availability.
    pub(crate) fn primary(&self, key: &str) -> Option<&Arc<Endpoint>> {
        self.select(key, |_| true)
    }

    /// The endpoint a key maps to among those accepted by `usable`.
    ///
    /// Ketama walks clockwise past rejected endpoints, so keys owned by
    /// healthy servers never move. Modulo rehashes over the usable buckets.
    pub(crate) fn select(
        &self,
        key: &str,
        usable: impl Fn(&Endpoint) -> bool,
    ) -> Option<&Arc<Endpoint>> {
        if self.endpoints.is_empty() {
            return None;
        }
        let hash = hash_key(key);

        match self.distribution {
            KeyDistribution::Ketama => {
                let start = self.points.partition_point(|(h, _)| *h < hash);
                let len = self.points.len();
                (0..len)
                    .map(|offset| self.points[(start + offset) % len].1)
                    .map(|idx| &self.endpoints[idx])
                    .find(|ep| usable(ep))
            }
            KeyDistribution::Modulo => {
                let usable_buckets: Vec<usize> = self
                    .buckets
                    .iter()
                    .copied()
                    .filter(|idx| usable(&self.endpoints[*idx]))
                    .collect();
                if usable_buckets.is_empty() {
                    return None;
                }
                let idx = usable_buckets[hash as usize % usable_buckets.len()];
                self.endpoints.get(idx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaisen_core::ServerAddress;
    use std::collections::HashMap;

    fn endpoints(n: u16) -> Vec<Arc<Endpoint>> {
        (1..=n)
            .map(|i| Arc::new(Endpoint::new(ServerAddress::new("10.0.0.1", i), 1, 10, None)))
            .collect()
    }

    fn keys() -> Vec<String> {
        (0..2000).map(|i| format!("key-{}", i)).collect()
    }

    #[test]
    fn test_empty_continuum_selects_nothing() {
        let ring = Continuum::empty(KeyDistribution::Ketama);
        assert!(ring.primary("k").is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ketama_spreads_keys() {
        let ring = Continuum::build(KeyDistribution::Ketama, endpoints(4));
        let mut counts: HashMap<u16, usize> = HashMap::new();
        for key in keys() {
            *counts.entry(ring.primary(&key).unwrap().address().port).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c > 200), "skewed: {:?}", counts);
    }

    #[test]
    fn test_ketama_skip_keeps_other_keys_in_place() {
        let ring = Continuum::build(KeyDistribution::Ketama, endpoints(4));
        let down = ServerAddress::new("10.0.0.1", 2);

        for key in keys() {
            let primary = ring.primary(&key).unwrap();
            let chosen = ring.select(&key, |ep| ep.address() != &down).unwrap();
            assert_ne!(chosen.address(), &down);
            if primary.address() != &down {
                assert!(Arc::ptr_eq(primary, chosen));
            }
        }
    }

    #[test]
    fn test_modulo_respects_weight() {
        let eps = vec![
            Arc::new(Endpoint::new(ServerAddress::new("a", 1), 3, 10, None)),
            Arc::new(Endpoint::new(ServerAddress::new("b", 1), 1, 10, None)),
        ];
        let ring = Continuum::build(KeyDistribution::Modulo, eps);
        let on_a = keys()
            .iter()
            .filter(|k| ring.primary(k).unwrap().address().host == "a")
            .count();
        assert!(on_a > 1200 && on_a < 1800, "on_a = {}", on_a);
    }

    #[test]
    fn test_select_none_when_nothing_usable() {
        let ring = Continuum::build(KeyDistribution::Modulo, endpoints(2));
        assert!(ring.select("k", |_| false).is_none());
        let ring = Continuum::build(KeyDistribution::Ketama, endpoints(2));
        assert!(ring.select("k", |_| false).is_none());
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("abd"));
    }
}
