//! Region adjacency by gap-expanded bounding boxes.

use crate::regions::Region;

/// Index lists: entry `i` holds the positions of every region whose box,
/// grown by `gap` pixels on each side, touches region `i`'s grown box.
pub fn neighbor_graph(regions: &[Region], gap: i32) -> Vec<Vec<usize>> {
    let grown: Vec<_> = regions.iter().map(|r| r.bbox.expanded(gap)).collect();
    let mut graph = vec![Vec::new(); regions.len()];
    for i in 0..grown.len() {
        for j in (i + 1)..grown.len() {
            if grown[i].touches(&grown[j]) {
                graph[i].push(j);
                graph[j].push(i);
            }
        }
    }
    graph
}

/// Store neighbor ids on each region.
pub fn attach_neighbors(mut regions: Vec<Region>, gap: i32) -> Vec<Region> {
    let graph = neighbor_graph(&regions, gap);
    let ids: Vec<usize> = regions.iter().map(|r| r.id).collect();
    for (region, adjacent) in regions.iter_mut().zip(graph) {
        let mut neighbor_ids: Vec<usize> = adjacent.into_iter().map(|j| ids[j]).collect();
        neighbor_ids.sort_unstable();
        region.neighbors = neighbor_ids;
    }
    let edges: usize = regions.iter().map(|r| r.neighbors.len()).sum::<usize>() / 2;
    log::debug!("neighbor graph: {} regions, {} edges", regions.len(), edges);
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::tests::rect_region;
    use proptest::prelude::*;

    #[test]
    fn gap_bridges_nearby_boxes_only() {
        let regions = vec![
            rect_region(10, 0, 0, 50, 50, [200, 40, 40]),
            rect_region(11, 70, 0, 50, 50, [30, 60, 210]),
            rect_region(12, 200, 0, 50, 50, [20, 160, 60]),
        ];
        let linked = attach_neighbors(regions, 12);
        assert_eq!(linked[0].neighbors, vec![11]);
        assert_eq!(linked[1].neighbors, vec![10]);
        assert!(linked[2].neighbors.is_empty());
    }

    #[test]
    fn zero_gap_still_links_touching_boxes() {
        let regions = vec![
            rect_region(0, 0, 0, 40, 40, [200, 40, 40]),
            rect_region(1, 40, 0, 40, 40, [30, 60, 210]),
        ];
        assert_eq!(neighbor_graph(&regions, 0), vec![vec![1], vec![0]]);
    }

    proptest! {
        #[test]
        fn adjacency_is_symmetric(
            boxes in proptest::collection::vec((0i32..300, 0i32..300, 1i32..80, 1i32..80), 0..24),
            gap in 0i32..20,
        ) {
            let regions: Vec<Region> = boxes
                .iter()
                .enumerate()
                .map(|(id, (x, y, w, h))| rect_region(id, *x, *y, *w, *h, [120, 80, 200]))
                .collect();
            let linked = attach_neighbors(regions, gap);
            for a in &linked {
                prop_assert!(!a.neighbors.contains(&a.id));
                for b in &a.neighbors {
                    prop_assert!(linked[*b].neighbors.contains(&a.id));
                }
            }
        }
    }
}
