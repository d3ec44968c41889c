use crate::cleanup::CleanupReport;
use crate::error::{DegradedSignal, StageSource};
use crate::geometry::{loop_to_svg_path, BoundingBox};
use crate::grading::ColorGroupSummary;
use crate::regions::{Grade, Region, RegionColor, RegionTag};
use crate::stage::StageReference;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatmapResult {
    pub width: u32,
    pub height: u32,
    pub regions: Vec<RegionRecord>,
    pub sections: Vec<Section>,
    pub stage: Option<StageRecord>,
    pub color_groups: Vec<ColorGroupSummary>,
    pub cleanup: CleanupReport,
    pub warnings: Vec<DegradedSignal>,
    pub perf: PerfStats,
    pub run_digest: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfStats {
    pub decode_ms: u64,
    pub foreground_ms: u64,
    pub text_ms: u64,
    pub segmentation_ms: u64,
    pub stage_ms: u64,
    pub cleanup_ms: u64,
    pub grading_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionRecord {
    pub region_id: String,
    pub polygon: Vec<[i32; 2]>,
    pub path_svg: String,
    pub bbox: BoundingBox,
    pub centroid: [f64; 2],
    pub area: f64,
    pub perimeter: f64,
    pub fill: RegionColor,
    pub tags: Vec<RegionTag>,
    pub grade: Option<Grade>,
    pub color_group: Option<usize>,
    pub capacity: Option<u32>,
    pub component_count: Option<u32>,
    pub ratio: f64,
    pub interactive: bool,
    pub ring_index: Option<u8>,
    pub distance_to_stage: Option<f64>,
    pub neighbors: Vec<String>,
}

/// Near-square seat layout for one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatGrid {
    pub rows: u32,
    pub cols: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub section_id: String,
    pub grade: Grade,
    pub capacity: Option<u32>,
    pub component_count: Option<u32>,
    /// Present once a component count is known.
    pub seat_grid: Option<SeatGrid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub rect: BoundingBox,
    pub anchor: [f64; 2],
    pub source: StageSource,
    pub placeholder: bool,
    pub region_id: Option<String>,
}

pub fn seat_grid(component_count: u32) -> SeatGrid {
    let n = component_count.max(1);
    let rows = (n as f64).sqrt().ceil() as u32;
    SeatGrid {
        rows,
        cols: n.div_ceil(rows),
    }
}

/// Stage and graded regions always render. Otherwise text, flat gray or black
/// fragments, and anything under `min_render_area` are left out.
pub fn should_render(region: &Region, min_render_area: f64) -> bool {
    if region.is_stage() || region.grade.is_some() {
        return true;
    }
    !(region.has(RegionTag::Textlike)
        || region.has(RegionTag::Gray)
        || region.has(RegionTag::Black)
        || region.area < min_render_area)
}

pub fn emit_regions(regions: &[Region], min_render_area: f64) -> Vec<RegionRecord> {
    let names: HashMap<usize, String> = regions.iter().map(|r| (r.id, r.display_id())).collect();
    regions
        .iter()
        .filter(|r| should_render(r, min_render_area))
        .map(|r| RegionRecord {
            region_id: r.display_id(),
            polygon: r.polygon.iter().map(|p| [p.x, p.y]).collect(),
            path_svg: loop_to_svg_path(&r.polygon),
            bbox: r.bbox,
            centroid: r.centroid,
            area: r.area,
            perimeter: r.perimeter,
            fill: r.fill.clone(),
            tags: r.tags.iter().copied().collect(),
            grade: r.grade,
            color_group: r.color_group,
            capacity: r.capacity,
            component_count: r.component_count,
            ratio: r.ratio,
            interactive: r.is_interactive(),
            ring_index: r.ring_index,
            distance_to_stage: r.distance_to_stage,
            neighbors: r
                .neighbors
                .iter()
                .filter_map(|id| names.get(id).cloned())
                .collect(),
        })
        .collect()
}

/// One section per graded region, most exclusive grade first, then nearest.
pub fn build_sections(regions: &[Region]) -> Vec<Section> {
    let mut graded: Vec<&Region> = regions.iter().filter(|r| r.grade.is_some()).collect();
    graded.sort_by(|a, b| {
        a.grade
            .cmp(&b.grade)
            .then(
                a.distance_to_stage
                    .partial_cmp(&b.distance_to_stage)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.id.cmp(&b.id))
    });
    graded
        .into_iter()
        .filter_map(|r| {
            Some(Section {
                section_id: r.display_id(),
                grade: r.grade?,
                capacity: r.capacity,
                component_count: r.component_count,
                seat_grid: r.component_count.map(seat_grid),
            })
        })
        .collect()
}

pub fn stage_record(stage: &StageReference, regions: &[Region]) -> StageRecord {
    let covering = regions.iter().find(|r| r.is_stage());
    StageRecord {
        rect: stage.rect,
        anchor: stage.anchor,
        source: stage.source,
        placeholder: covering.is_some_and(|r| r.has(RegionTag::StagePlaceholder)),
        region_id: covering.map(Region::display_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::tests::rect_region;

    #[test]
    fn seat_grid_is_near_square() {
        assert_eq!(seat_grid(1), SeatGrid { rows: 1, cols: 1 });
        assert_eq!(seat_grid(10), SeatGrid { rows: 4, cols: 3 });
        assert_eq!(seat_grid(16), SeatGrid { rows: 4, cols: 4 });
        assert_eq!(seat_grid(17), SeatGrid { rows: 5, cols: 4 });
        for n in 1..200 {
            let g = seat_grid(n);
            assert!(g.rows * g.cols >= n);
        }
    }

    #[test]
    fn render_filter_keeps_stage_and_graded() {
        let mut graded_gray = rect_region(0, 0, 0, 10, 10, [128, 128, 128]).with_tag(RegionTag::Gray);
        graded_gray.grade = Some(Grade::S);
        let regions = vec![
            graded_gray,
            rect_region(1, 0, 0, 10, 10, [128, 128, 128]).with_tag(RegionTag::Stage),
            rect_region(2, 0, 0, 100, 100, [128, 128, 128]).with_tag(RegionTag::Gray),
            rect_region(3, 0, 0, 10, 10, [200, 40, 40]),
            rect_region(4, 0, 0, 30, 30, [200, 40, 40]),
        ];
        let ids: Vec<String> = emit_regions(&regions, 450.0)
            .into_iter()
            .map(|r| r.region_id)
            .collect();
        assert_eq!(ids, vec!["poly_0000", "poly_0001", "poly_0004"]);
    }

    #[test]
    fn records_carry_svg_path_and_neighbor_names() {
        let mut a = rect_region(0, 0, 0, 30, 30, [200, 40, 40]);
        a.neighbors = vec![1];
        let b = rect_region(1, 40, 0, 30, 30, [30, 60, 210])
            .with_tag(RegionTag::Stage)
            .with_tag(RegionTag::StagePlaceholder);
        let records = emit_regions(&[a, b], 0.0);
        assert_eq!(records[0].path_svg, "M 0 0 L 30 0 L 30 30 L 0 30 Z");
        assert_eq!(records[0].neighbors, vec!["poly_STAGE"]);
        assert!(records[0].interactive);
        assert!(!records[1].interactive);
    }

    #[test]
    fn sections_follow_grade_then_distance() {
        let mut far_vip = rect_region(0, 0, 0, 10, 10, [200, 40, 40]);
        far_vip.grade = Some(Grade::Vip);
        far_vip.distance_to_stage = Some(90.0);
        let mut near_vip = rect_region(1, 0, 0, 10, 10, [200, 40, 40]);
        near_vip.grade = Some(Grade::Vip);
        near_vip.distance_to_stage = Some(30.0);
        near_vip.component_count = Some(10);
        let mut r = rect_region(2, 0, 0, 10, 10, [30, 60, 210]);
        r.grade = Some(Grade::R);
        r.distance_to_stage = Some(10.0);
        let ungraded = rect_region(3, 0, 0, 10, 10, [30, 60, 210]);

        let sections = build_sections(&[r, far_vip, ungraded, near_vip]);
        let ids: Vec<&str> = sections.iter().map(|s| s.section_id.as_str()).collect();
        assert_eq!(ids, vec!["poly_0001", "poly_0000", "poly_0002"]);
        assert_eq!(sections[0].seat_grid, Some(SeatGrid { rows: 4, cols: 3 }));
        assert_eq!(sections[1].seat_grid, None);
    }

    #[test]
    fn result_serializes_camel_case() {
        let json = serde_json::to_value(PerfStats::default()).unwrap();
        assert!(json.get("segmentationMs").is_some());
        let json = serde_json::to_value(seat_grid(3)).unwrap();
        assert_eq!(json, serde_json::json!({"rows": 2, "cols": 2}));
        let report = CleanupReport {
            islands: 1,
            nested: 0,
            sub_polygons: 2,
        };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json, serde_json::json!({"islands": 1, "nested": 0, "subPolygons": 2}));
    }
}
