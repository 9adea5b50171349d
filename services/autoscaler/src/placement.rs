//! Zone placement for new workers.
//!
//! Launches go to the zone currently holding the fewest workers, so repeated
//! single-node scale-ups converge toward an even spread instead of piling
//! into one zone. Pure function; the compute client feeds it live inventory.

use std::collections::BTreeMap;

/// Pick the zone with the fewest workers and return `(zone, subnet)` for the
/// launch, using that zone's first registered subnet.
///
/// Zones with no registered subnets are not eligible. Workers sitting in
/// zones we have no subnet for are ignored; we could not rebalance them
/// anyway. Ties break toward the lexicographically first zone name, which
/// keeps the choice deterministic. Returns `None` when no subnet is
/// configured at all.
pub fn pick_launch_subnet<'a>(
    subnets_by_zone: &'a BTreeMap<String, Vec<String>>,
    occupied_zones: &[String],
) -> Option<(&'a str, &'a str)> {
    let mut counts: BTreeMap<&str, usize> = subnets_by_zone
        .iter()
        .filter(|(_, subnets)| !subnets.is_empty())
        .map(|(zone, _)| (zone.as_str(), 0))
        .collect();

    for zone in occupied_zones {
        if let Some(count) = counts.get_mut(zone.as_str()) {
            *count += 1;
        }
    }

    let (zone, _) = counts
        .into_iter()
        .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)))?;

    let subnet = subnets_by_zone[zone].first()?;
    Some((zone, subnet.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(zone, subnets)| {
                (
                    zone.to_string(),
                    subnets.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect()
    }

    fn occupied(zs: &[&str]) -> Vec<String> {
        zs.iter().map(|z| z.to_string()).collect()
    }

    #[test]
    fn picks_least_loaded_zone() {
        let map = zones(&[("eu-1a", &["sn-a"]), ("eu-1b", &["sn-b"]), ("eu-1c", &["sn-c"])]);
        let got = pick_launch_subnet(&map, &occupied(&["eu-1a", "eu-1a", "eu-1b"]));
        assert_eq!(got, Some(("eu-1c", "sn-c")));
    }

    #[test]
    fn empty_zone_beats_occupied_zones() {
        let map = zones(&[("eu-1a", &["sn-a"]), ("eu-1b", &["sn-b"])]);
        let got = pick_launch_subnet(&map, &occupied(&["eu-1a"]));
        assert_eq!(got, Some(("eu-1b", "sn-b")));
    }

    #[test]
    fn tie_breaks_to_first_zone_name() {
        let map = zones(&[("eu-1a", &["sn-a"]), ("eu-1b", &["sn-b"])]);
        assert_eq!(pick_launch_subnet(&map, &[]), Some(("eu-1a", "sn-a")));
    }

    #[test]
    fn first_subnet_of_zone_is_used() {
        let map = zones(&[("eu-1a", &["sn-a1", "sn-a2"])]);
        assert_eq!(pick_launch_subnet(&map, &[]), Some(("eu-1a", "sn-a1")));
    }

    #[test]
    fn zone_without_subnets_is_skipped() {
        let map = zones(&[("eu-1a", &[]), ("eu-1b", &["sn-b"])]);
        let got = pick_launch_subnet(&map, &occupied(&["eu-1b", "eu-1b"]));
        assert_eq!(got, Some(("eu-1b", "sn-b")));
    }

    #[test]
    fn workers_in_unknown_zones_are_ignored() {
        let map = zones(&[("eu-1a", &["sn-a"]), ("eu-1b", &["sn-b"])]);
        let got = pick_launch_subnet(&map, &occupied(&["us-9z", "us-9z", "eu-1a"]));
        assert_eq!(got, Some(("eu-1b", "sn-b")));
    }

    #[test]
    fn no_subnets_configured_yields_none() {
        assert_eq!(pick_launch_subnet(&BTreeMap::new(), &occupied(&["eu-1a"])), None);
    }

    #[test]
    fn sequential_launches_stay_balanced() {
        let map = zones(&[("eu-1a", &["sn-a"]), ("eu-1b", &["sn-b"]), ("eu-1c", &["sn-c"])]);
        let mut placed = occupied(&["eu-1a", "eu-1a", "eu-1a", "eu-1b"]);

        for _ in 0..20 {
            let (zone, _) = pick_launch_subnet(&map, &placed).unwrap();
            placed.push(zone.to_string());
        }

        let mut per_zone = BTreeMap::new();
        for zone in &placed {
            *per_zone.entry(zone.as_str()).or_insert(0usize) += 1;
        }
        let max = per_zone.values().max().unwrap();
        let min = per_zone.values().min().unwrap();
        assert!(max - min <= 1, "unbalanced spread: {per_zone:?}");
    }
}
