use image::{Rgb, RgbImage};
use seatmap_lib::capacity::allocate_capacity;
use seatmap_lib::geometry::BoundingBox;
use seatmap_lib::regions::{Region, RegionTag};
use seatmap_lib::{
    process_rgb_image, process_seatmap, DegradedSignal, Grade, NoOcr, OcrLine, PipelineConfig,
    PrecomputedOcr, SeatmapError, StageSource,
};

const WHITE: [u8; 3] = [255, 255, 255];
const STAGE_GRAY: [u8; 3] = [110, 110, 110];
const RED: [u8; 3] = [220, 20, 30];
const BLUE: [u8; 3] = [30, 60, 210];
const GREEN: [u8; 3] = [20, 160, 60];
const PURPLE: [u8; 3] = [120, 40, 160];

fn paint(image: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, rgb: [u8; 3]) {
    for y in y0..y1 {
        for x in x0..x1 {
            image.put_pixel(x, y, Rgb(rgb));
        }
    }
}

/// Gray stage bar at the top with three colored tiers below it.
fn three_tier_chart() -> RgbImage {
    let mut image = RgbImage::from_pixel(500, 360, Rgb(WHITE));
    paint(&mut image, 150, 20, 350, 50, STAGE_GRAY);
    paint(&mut image, 100, 80, 400, 150, RED);
    paint(&mut image, 60, 170, 440, 240, BLUE);
    paint(&mut image, 20, 260, 480, 330, GREEN);
    image
}

#[test]
fn three_tier_chart_grades_by_distance_and_fills_capacity() {
    let config = PipelineConfig {
        total_attendees: Some(1000),
        ..PipelineConfig::default()
    };
    let result = process_rgb_image(&three_tier_chart(), &config, &NoOcr).unwrap();

    let stage = result.stage.as_ref().unwrap();
    assert_ne!(stage.source, StageSource::PositionalDefault);
    assert!(stage.rect.y < 60, "stage rect {:?}", stage.rect);
    assert!((stage.anchor[0] - 250.0).abs() < 20.0);

    let stage_regions: Vec<_> = result
        .regions
        .iter()
        .filter(|r| r.tags.contains(&RegionTag::Stage))
        .collect();
    assert_eq!(stage_regions.len(), 1);
    assert!(!stage_regions[0].interactive);
    assert_eq!(stage_regions[0].grade, None);

    assert!(!result.sections.is_empty());
    assert_eq!(result.sections[0].grade, Grade::Vip);
    let seats: u32 = result.sections.iter().filter_map(|s| s.capacity).sum();
    assert_eq!(seats, 1000);
    for section in &result.sections {
        let grid = section.seat_grid.unwrap();
        assert!(grid.rows * grid.cols >= section.component_count.unwrap());
    }

    // Nearer tiers never get a lower grade than farther ones.
    let mut graded: Vec<_> = result
        .regions
        .iter()
        .filter(|r| r.grade.is_some())
        .collect();
    graded.sort_by(|a, b| a.distance_to_stage.partial_cmp(&b.distance_to_stage).unwrap());
    for pair in graded.windows(2) {
        assert!(pair[0].grade <= pair[1].grade);
    }
    let grades: Vec<_> = graded.iter().filter_map(|r| r.grade).collect();
    assert_eq!(grades, vec![Grade::Vip, Grade::R, Grade::S]);
    assert!(graded.iter().all(|r| r.interactive));
}

/// Grades of every graded region, nearest to the stage first.
fn grades_by_distance(result: &seatmap_lib::SeatmapResult) -> Vec<Grade> {
    let mut graded: Vec<_> = result
        .regions
        .iter()
        .filter(|r| r.grade.is_some())
        .collect();
    graded.sort_by(|a, b| a.distance_to_stage.partial_cmp(&b.distance_to_stage).unwrap());
    graded.iter().filter_map(|r| r.grade).collect()
}

#[test]
fn colored_stage_found_by_ocr_is_never_graded() {
    let mut image = RgbImage::from_pixel(500, 360, Rgb(WHITE));
    paint(&mut image, 150, 20, 350, 60, PURPLE);
    paint(&mut image, 100, 90, 400, 150, RED);
    paint(&mut image, 60, 170, 440, 240, BLUE);
    paint(&mut image, 20, 260, 480, 330, GREEN);
    let ocr = PrecomputedOcr {
        lines: vec![OcrLine {
            text: "STAGE".to_string(),
            score: 0.95,
            polygon: vec![[215.0, 28.0], [285.0, 28.0], [285.0, 52.0], [215.0, 52.0]],
        }],
    };
    let result = process_rgb_image(&image, &PipelineConfig::default(), &ocr).unwrap();

    let stage = result.stage.as_ref().unwrap();
    assert_eq!(stage.source, StageSource::Ocr);
    assert!(!stage.placeholder);
    assert!(!result
        .warnings
        .contains(&DegradedSignal::StagePlaceholderInjected));

    let stage_regions: Vec<_> = result
        .regions
        .iter()
        .filter(|r| r.tags.contains(&RegionTag::Stage))
        .collect();
    assert_eq!(stage_regions.len(), 1);
    let block = stage_regions[0];
    assert!(block.bbox.x <= 160 && block.bbox.x + block.bbox.w >= 340, "{:?}", block.bbox);
    assert_eq!(block.grade, None);
    assert!(!block.interactive);
    assert_eq!(stage.region_id.as_deref(), Some(block.region_id.as_str()));

    // Nothing overlapping the purple block picks up a grade.
    for region in result.regions.iter().filter(|r| r.grade.is_some()) {
        assert!(region.bbox.y >= 70, "{} at {:?}", region.region_id, region.bbox);
    }
    assert_eq!(grades_by_distance(&result), vec![Grade::Vip, Grade::R, Grade::S]);
}

/// Nested horseshoe tiers opening toward a gray stage, like an arena bowl.
fn horseshoe_chart() -> RgbImage {
    let mut image = RgbImage::from_pixel(500, 400, Rgb(WHITE));
    paint(&mut image, 200, 20, 300, 50, STAGE_GRAY);
    for (inset, bottom, rgb) in [(160, 130, RED), (110, 190, BLUE), (50, 260, GREEN)] {
        let (left, right) = (inset, 500 - inset);
        paint(&mut image, left, 20, left + 20, bottom, rgb);
        paint(&mut image, right - 20, 20, right, bottom, rgb);
        paint(&mut image, left, bottom - 20, right, bottom, rgb);
    }
    image
}

#[test]
fn nested_horseshoe_tiers_grade_from_the_inside_out() {
    let config = PipelineConfig {
        total_attendees: Some(600),
        ..PipelineConfig::default()
    };
    let result = process_rgb_image(&horseshoe_chart(), &config, &NoOcr).unwrap();

    let stage = result.stage.as_ref().unwrap();
    assert_ne!(stage.source, StageSource::PositionalDefault);
    let stage_regions: Vec<_> = result
        .regions
        .iter()
        .filter(|r| r.tags.contains(&RegionTag::Stage))
        .collect();
    assert_eq!(stage_regions.len(), 1);
    assert!(!stage_regions[0].interactive);

    // The tiers wrap around the stage box but are still seating.
    assert_eq!(grades_by_distance(&result), vec![Grade::Vip, Grade::R, Grade::S]);
    assert!(result
        .regions
        .iter()
        .filter(|r| r.grade.is_some())
        .all(|r| r.interactive && !r.tags.contains(&RegionTag::StageOverlap)));
    let seats: u32 = result.sections.iter().filter_map(|s| s.capacity).sum();
    assert_eq!(seats, 600);
}

#[test]
fn repeated_runs_are_identical() {
    let image = three_tier_chart();
    let config = PipelineConfig::fast();
    let a = process_rgb_image(&image, &config, &NoOcr).unwrap();
    let b = process_rgb_image(&image, &config, &NoOcr).unwrap();
    assert_eq!(a.run_digest, b.run_digest);
    assert_eq!(
        serde_json::to_value(&a.regions).unwrap(),
        serde_json::to_value(&b.regions).unwrap()
    );
    assert_eq!(
        serde_json::to_value(&a.sections).unwrap(),
        serde_json::to_value(&b.sections).unwrap()
    );
}

#[test]
fn uniform_image_gets_default_stage_and_placeholder() {
    let image = RgbImage::from_pixel(200, 200, Rgb([200, 200, 200]));
    let result = process_rgb_image(&image, &PipelineConfig::default(), &NoOcr).unwrap();

    let stage = result.stage.as_ref().unwrap();
    assert_eq!(stage.source, StageSource::PositionalDefault);
    assert!(stage.placeholder);
    assert_eq!(stage.region_id.as_deref(), Some("poly_STAGE"));
    assert!(result.sections.is_empty());
    assert!(result
        .warnings
        .contains(&DegradedSignal::StagePositionalDefault));
    assert!(result
        .warnings
        .contains(&DegradedSignal::StagePlaceholderInjected));
}

#[test]
fn attendees_on_an_ungradable_image_fail() {
    let image = RgbImage::from_pixel(120, 80, Rgb([200, 200, 200]));
    let config = PipelineConfig {
        total_attendees: Some(40),
        ..PipelineConfig::default()
    };
    let err = process_rgb_image(&image, &config, &NoOcr).unwrap_err();
    assert!(matches!(
        err,
        SeatmapError::EmptyRegionSet {
            total_attendees: 40
        }
    ));
}

#[test]
fn capacity_follows_area_shares() {
    let regions: Vec<Region> = [(0, 500), (1, 300), (2, 200)]
        .into_iter()
        .map(|(id, w)| {
            let polygon = BoundingBox {
                x: 0,
                y: id * 20,
                w,
                h: 10,
            }
            .corners();
            let mut region = Region::from_polygon(id as usize, polygon, 0, None, 0.0).unwrap();
            region.grade = Some(Grade::R);
            region
        })
        .collect();

    let out = allocate_capacity(regions, Some(1000), 10).unwrap();
    let caps: Vec<u32> = out.iter().filter_map(|r| r.capacity).collect();
    assert_eq!(caps, vec![500, 300, 200]);
    let components: Vec<u32> = out.iter().filter_map(|r| r.component_count).collect();
    assert_eq!(components, vec![50, 30, 20]);
}

#[test]
fn garbage_bytes_are_rejected() {
    let err = process_seatmap(&[0u8, 1, 2, 3], &PipelineConfig::default(), &NoOcr).unwrap_err();
    assert!(matches!(err, SeatmapError::Input(_)));
}
