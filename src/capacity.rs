//! Attendee distribution over graded regions.

use crate::error::{Result, SeatmapError};
use crate::regions::Region;

/// Area share of each graded region, plus capacities summing exactly to
/// `total_attendees` when one is given.
pub fn allocate_capacity(
    mut regions: Vec<Region>,
    total_attendees: Option<u32>,
    seats_per_component: u32,
) -> Result<Vec<Region>> {
    let graded: Vec<usize> = (0..regions.len())
        .filter(|&i| regions[i].grade.is_some())
        .collect();
    let graded_area: f64 = graded.iter().map(|&i| regions[i].area).sum();

    for region in regions.iter_mut() {
        region.ratio = 0.0;
        region.capacity = None;
        region.component_count = None;
    }
    if graded_area > 0.0 {
        for &i in &graded {
            regions[i].ratio = regions[i].area / graded_area;
        }
    }

    let Some(total) = total_attendees else {
        return Ok(regions);
    };
    if graded.is_empty() {
        if total > 0 {
            return Err(SeatmapError::EmptyRegionSet {
                total_attendees: total,
            });
        }
        return Ok(regions);
    }

    let areas: Vec<f64> = graded.iter().map(|&i| regions[i].area).collect();
    let capacities = distribute(total, &areas);
    let per_component = seats_per_component.max(1);
    for (&i, capacity) in graded.iter().zip(capacities) {
        regions[i].capacity = Some(capacity);
        regions[i].component_count = Some(capacity.div_ceil(per_component).max(1));
    }

    log::info!(
        "capacity: {} attendees over {} graded regions",
        total,
        graded.len()
    );
    Ok(regions)
}

/// Proportional rounding with the remainder walked over regions by area rank:
/// largest first when seats are missing, smallest first when there are too many.
pub fn distribute(total: u32, areas: &[f64]) -> Vec<u32> {
    if areas.is_empty() {
        return Vec::new();
    }
    let sum: f64 = areas.iter().sum();
    let mut caps: Vec<i64> = if sum > 0.0 {
        areas
            .iter()
            .map(|a| (total as f64 * a / sum).round() as i64)
            .collect()
    } else {
        vec![0; areas.len()]
    };
    let mut diff = total as i64 - caps.iter().sum::<i64>();
    if diff != 0 {
        let mut order: Vec<usize> = (0..areas.len()).collect();
        order.sort_by(|&a, &b| {
            let by_area = areas[a]
                .partial_cmp(&areas[b])
                .unwrap_or(std::cmp::Ordering::Equal);
            if diff > 0 {
                by_area.reverse()
            } else {
                by_area
            }
        });
        let mut cursor = 0usize;
        while diff != 0 {
            let idx = order[cursor];
            if diff > 0 {
                caps[idx] += 1;
                diff -= 1;
            } else if caps[idx] > 0 {
                caps[idx] -= 1;
                diff += 1;
            }
            cursor = (cursor + 1) % order.len();
        }
    }
    caps.into_iter().map(|c| c.max(0) as u32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::tests::rect_region;
    use crate::regions::Grade;
    use proptest::prelude::*;

    fn graded(id: usize, w: i32, h: i32) -> Region {
        let mut r = rect_region(id, 0, 0, w, h, [200, 40, 40]);
        r.grade = Some(Grade::R);
        r
    }

    #[test]
    fn exact_shares_are_kept() {
        let regions = vec![graded(0, 50, 10), graded(1, 30, 10), graded(2, 20, 10)];
        let out = allocate_capacity(regions, Some(1000), 1).unwrap();
        let caps: Vec<Option<u32>> = out.iter().map(|r| r.capacity).collect();
        assert_eq!(caps, vec![Some(500), Some(300), Some(200)]);
        assert!((out[0].ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn remainder_walks_regions_by_area_rank() {
        assert_eq!(distribute(10, &[1.0, 1.0, 1.0]), vec![4, 3, 3]);
        assert_eq!(distribute(2, &[1.0, 1.0, 1.0]), vec![0, 1, 1]);
        assert_eq!(distribute(0, &[5.0]), vec![0]);
    }

    #[test]
    fn component_count_rounds_up_and_never_hits_zero() {
        let regions = vec![graded(0, 10, 10), graded(1, 10, 1)];
        let out = allocate_capacity(regions, Some(21), 4).unwrap();
        assert_eq!(out[0].capacity, Some(19));
        assert_eq!(out[0].component_count, Some(5));
        assert_eq!(out[1].capacity, Some(2));
        assert_eq!(out[1].component_count, Some(1));
    }

    #[test]
    fn ungraded_regions_carry_nothing() {
        let regions = vec![graded(0, 10, 10), rect_region(1, 0, 0, 90, 90, [128, 128, 128])];
        let out = allocate_capacity(regions, Some(7), 1).unwrap();
        assert_eq!(out[0].capacity, Some(7));
        assert_eq!(out[1].capacity, None);
        assert_eq!(out[1].ratio, 0.0);
    }

    #[test]
    fn missing_total_leaves_capacity_null() {
        let out = allocate_capacity(vec![graded(0, 10, 10)], None, 1).unwrap();
        assert_eq!(out[0].capacity, None);
        assert_eq!(out[0].component_count, None);
        assert_eq!(out[0].ratio, 1.0);
    }

    #[test]
    fn attendees_without_graded_regions_is_an_error() {
        let ungraded = vec![rect_region(0, 0, 0, 10, 10, [128, 128, 128])];
        let err = allocate_capacity(ungraded.clone(), Some(50), 1).unwrap_err();
        assert!(matches!(err, SeatmapError::EmptyRegionSet { total_attendees: 50 }));
        assert!(allocate_capacity(ungraded, Some(0), 1).is_ok());
    }

    proptest! {
        #[test]
        fn capacities_sum_to_total(
            total in 0u32..200_000,
            areas in proptest::collection::vec(0.5f64..1.0e6, 1..40),
        ) {
            let caps = distribute(total, &areas);
            prop_assert_eq!(caps.len(), areas.len());
            prop_assert_eq!(caps.iter().map(|c| *c as u64).sum::<u64>(), total as u64);
        }
    }
}
