//! Seat grading: color groups ordered by distance to the stage.

use crate::color::{chroma, delta_e, lab_from_array, GrayThresholds, LabColor};
use crate::config::PipelineConfig;
use crate::error::{DegradedSignal, Warnings};
use crate::regions::{Grade, Region, RegionColor, RegionTag};
use crate::stage::StageReference;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Share of sorted distances dropped from each end before averaging.
const TRIM_FRACTION: f64 = 0.10;
/// A gray/black-flagged region this much more chromatic than the gray cut is graded anyway.
const GRAY_ESCAPE_FACTOR: f32 = 1.35;
const ORPHAN_DELTA_FACTOR: f32 = 1.10;
const ORPHAN_DISTANCE_TOLERANCE: f64 = 0.35;
/// Gray-flagged orphans qualify only when fewer of their pixels than this are gray.
const ORPHAN_MAX_GRAY_RATIO: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorGroupSummary {
    pub group: usize,
    pub grade: Grade,
    pub count: usize,
    pub median_distance: f64,
    pub trimmed_mean_distance: f64,
    pub mean_color: RegionColor,
}

#[derive(Debug, Clone)]
pub struct GradeOutcome {
    pub regions: Vec<Region>,
    pub groups: Vec<ColorGroupSummary>,
}

/// Labels for `count` groups, nearest group first.
pub fn labels_for_group_count(count: usize) -> &'static [Grade] {
    match count {
        0 => &[],
        1 => &[Grade::R],
        2 => &[Grade::Vip, Grade::R],
        3 => &[Grade::Vip, Grade::R, Grade::S],
        _ => &[Grade::Standing, Grade::Vip, Grade::R, Grade::S],
    }
}

/// Label for the group at `rank` among `count` groups. Ranks past the table's
/// end share its last label.
pub fn label_for_rank(rank: usize, count: usize) -> Option<Grade> {
    let labels = labels_for_group_count(count);
    labels.get(rank.min(labels.len().saturating_sub(1))).copied()
}

/// Positions of `candidates` sorted by area descending, then id ascending.
pub fn canonical_order(regions: &[Region], candidates: impl IntoIterator<Item = usize>) -> Vec<usize> {
    let mut order: Vec<usize> = candidates.into_iter().collect();
    order.sort_by(|&a, &b| {
        regions[b]
            .area
            .partial_cmp(&regions[a].area)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(regions[a].id.cmp(&regions[b].id))
    });
    order
}

/// Greedy single-link clustering: each region joins the first group whose
/// anchor (its first member's color) is within `delta`, else opens a new one.
pub fn cluster_by_color(regions: &[Region], order: &[usize], delta: f32) -> Vec<Vec<usize>> {
    let mut anchors: Vec<LabColor> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for &idx in order {
        let lab = regions[idx].lab();
        match anchors.iter().position(|a| delta_e(lab, *a) <= delta) {
            Some(g) => groups[g].push(idx),
            None => {
                anchors.push(lab);
                groups.push(vec![idx]);
            }
        }
    }
    groups
}

/// Provisional `color_group` for every non-stage region, used by cleanup.
pub fn assign_provisional_groups(mut regions: Vec<Region>, delta: f32) -> Vec<Region> {
    let candidates: Vec<usize> = (0..regions.len()).filter(|&i| !regions[i].is_stage()).collect();
    let order = canonical_order(&regions, candidates);
    let groups = cluster_by_color(&regions, &order, delta);
    for region in regions.iter_mut() {
        region.color_group = None;
    }
    for (g, members) in groups.iter().enumerate() {
        for &idx in members {
            regions[idx].color_group = Some(g);
        }
    }
    regions
}

pub fn trimmed_mean(values: &[f64], trim: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let k = (sorted.len() as f64 * trim).floor() as usize;
    let kept = if sorted.len() > 2 * k {
        &sorted[k..sorted.len() - k]
    } else {
        &sorted[..]
    };
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Linear-interpolation quantile of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    quantile(&sorted, 0.5)
}

pub fn ring_index(distance: f64, cuts: &[f64; 3]) -> u8 {
    cuts.iter().position(|c| distance <= *c).unwrap_or(3) as u8
}

fn is_stage_or_text(region: &Region) -> bool {
    region.is_stage() || region.has(RegionTag::StageOverlap) || region.has(RegionTag::Textlike)
}

fn escapes_gray(region: &Region, thresholds: &GrayThresholds) -> bool {
    chroma(region.lab()) > GRAY_ESCAPE_FACTOR * thresholds.chroma
}

fn is_eligible(region: &Region, thresholds: &GrayThresholds) -> bool {
    if is_stage_or_text(region) || region.area <= 0.0 {
        return false;
    }
    if region.has(RegionTag::Gray) || region.has(RegionTag::Black) {
        return escapes_gray(region, thresholds);
    }
    true
}

/// Ungraded regions that may still be seating: neutral on average but mostly
/// tinted pixels, as with hatched or speckled fills. Flat gray and black fills
/// stay out.
fn is_orphan_candidate(region: &Region, thresholds: &GrayThresholds) -> bool {
    if region.grade.is_some() || is_stage_or_text(region) {
        return false;
    }
    if region.has(RegionTag::Black) && !escapes_gray(region, thresholds) {
        return false;
    }
    !region.has(RegionTag::Gray) || region.gray_ratio < ORPHAN_MAX_GRAY_RATIO
}

fn distance_to(region: &Region, anchor: [f64; 2]) -> f64 {
    (region.centroid[0] - anchor[0]).hypot(region.centroid[1] - anchor[1])
}

/// Grade every eligible region and recover plausible orphans next to graded ones.
pub fn assign_grades(
    regions: Vec<Region>,
    stage: &StageReference,
    thresholds: &GrayThresholds,
    config: &PipelineConfig,
    warnings: &mut Warnings,
) -> GradeOutcome {
    let mut regions: Vec<Region> = regions
        .into_iter()
        .map(|mut r| {
            r.color_group = None;
            r.grade = None;
            r.ring_index = None;
            r.distance_to_stage = (!r.is_stage()).then(|| distance_to(&r, stage.anchor));
            r
        })
        .collect();

    let eligible: Vec<usize> = (0..regions.len())
        .filter(|&i| is_eligible(&regions[i], thresholds))
        .collect();
    let order = canonical_order(&regions, eligible);
    let clusters = cluster_by_color(&regions, &order, config.color_delta);

    let mut ranked: Vec<(f64, Vec<usize>)> = clusters
        .into_iter()
        .filter_map(|members| {
            let distances: Vec<f64> = members
                .iter()
                .filter_map(|&i| regions[i].distance_to_stage)
                .collect();
            trimmed_mean(&distances, TRIM_FRACTION).map(|d| (d, members))
        })
        .collect();
    // Stable, so equal keys keep first-seen group order.
    ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let group_count = ranked.len();
    for (rank, (_, members)) in ranked.iter().enumerate() {
        let grade = label_for_rank(rank, group_count);
        for &i in members {
            regions[i].color_group = Some(rank);
            regions[i].grade = grade;
        }
    }

    let recovered = recover_orphans(&mut regions, &ranked, thresholds, config.color_delta);

    let graded_distances: Vec<f64> = {
        let mut d: Vec<f64> = regions
            .iter()
            .filter(|r| r.grade.is_some())
            .filter_map(|r| r.distance_to_stage)
            .collect();
        d.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        d
    };
    if !graded_distances.is_empty() {
        let q = config.ring_quantiles;
        let cuts = [
            quantile(&graded_distances, q[0]),
            quantile(&graded_distances, q[1]),
            quantile(&graded_distances, q[2]),
        ];
        for region in regions.iter_mut().filter(|r| r.grade.is_some()) {
            region.ring_index = region.distance_to_stage.map(|d| ring_index(d, &cuts));
        }
    } else {
        warnings.push(DegradedSignal::NoGradedRegions);
    }

    let groups = summarize_groups(&regions, &ranked);
    log::info!(
        "grading: {} color groups, {} graded regions ({} recovered orphans)",
        group_count,
        graded_distances.len(),
        recovered
    );
    GradeOutcome { regions, groups }
}

/// Each orphan candidate joins the group of its closest-colored graded
/// neighbor when the color and distance agree. Decisions use the grading state
/// from before recovery.
fn recover_orphans(
    regions: &mut [Region],
    ranked: &[(f64, Vec<usize>)],
    thresholds: &GrayThresholds,
    delta: f32,
) -> usize {
    let index_of: HashMap<usize, usize> = regions.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
    let max_delta = delta * ORPHAN_DELTA_FACTOR;

    let mut adoptions: Vec<(usize, usize, Grade)> = Vec::new();
    for (i, orphan) in regions.iter().enumerate() {
        if !is_orphan_candidate(orphan, thresholds) {
            continue;
        }
        let lab = orphan.lab();
        let matching: Vec<(f32, usize)> = orphan
            .neighbors
            .iter()
            .filter_map(|id| index_of.get(id).copied())
            .filter(|&j| regions[j].grade.is_some())
            .map(|j| (delta_e(lab, regions[j].lab()), j))
            .filter(|(d, _)| *d <= max_delta)
            .collect();
        let Some(&(_, nearest)) = matching
            .iter()
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        else {
            continue;
        };
        let Some(group) = regions[nearest].color_group else {
            continue;
        };
        let group_mean = ranked.get(group).map(|(d, _)| *d);
        if let (Some(mean), Some(own)) = (group_mean, orphan.distance_to_stage) {
            if mean > 0.0 && (own - mean).abs() > ORPHAN_DISTANCE_TOLERANCE * mean {
                continue;
            }
        }

        let mut votes: BTreeMap<Grade, usize> = BTreeMap::new();
        for (_, j) in &matching {
            if let Some(g) = regions[*j].grade {
                *votes.entry(g).or_default() += 1;
            }
        }
        let fallback = regions[nearest].grade.unwrap_or(Grade::S);
        let best = votes.values().copied().max().unwrap_or(0);
        let grade = if votes.get(&fallback).copied() == Some(best) {
            fallback
        } else {
            votes
                .iter()
                .find(|(_, n)| **n == best)
                .map(|(g, _)| *g)
                .unwrap_or(fallback)
        };
        adoptions.push((i, group, grade));
    }

    let count = adoptions.len();
    for (i, group, grade) in adoptions {
        regions[i].color_group = Some(group);
        regions[i].grade = Some(grade);
    }
    count
}

fn summarize_groups(regions: &[Region], ranked: &[(f64, Vec<usize>)]) -> Vec<ColorGroupSummary> {
    ranked
        .iter()
        .enumerate()
        .filter_map(|(rank, (trimmed, _))| {
            let grade = label_for_rank(rank, ranked.len())?;
            let members: Vec<&Region> = regions.iter().filter(|r| r.color_group == Some(rank)).collect();
            let distances: Vec<f64> = members.iter().filter_map(|r| r.distance_to_stage).collect();
            let n = members.len() as f32;
            let sum = members.iter().fold([0.0f32; 3], |acc, r| {
                [acc[0] + r.lab[0], acc[1] + r.lab[1], acc[2] + r.lab[2]]
            });
            let mean = lab_from_array([sum[0] / n, sum[1] / n, sum[2] / n]);
            Some(ColorGroupSummary {
                group: rank,
                grade,
                count: members.len(),
                median_distance: median(&distances),
                trimmed_mean_distance: *trimmed,
                mean_color: RegionColor::from_lab(mean),
            })
        })
        .collect()
}
