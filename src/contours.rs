//! Mask to polygon reduction
//!
//! A raster instance mask is rescaled to the image it belongs to, its outer
//! borders are traced, the dominant blob is kept and its outline is reduced
//! with a Douglas-Peucker approximation whose tolerance scales with the
//! outline's perimeter.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point;

use crate::coco::calculate_polygon_area;

/// Tolerance of the polygon approximation as a fraction of the perimeter
pub const APPROXIMATION_RATIO: f64 = 0.002;

/// True when the mask has no foreground pixel
pub fn is_empty_mask(mask: &GrayImage) -> bool {
    mask.as_raw().iter().all(|&value| value == 0)
}

/// Outer borders of all foreground regions (non-zero pixels), every boundary
/// pixel in traversal order. Hole borders are dropped.
pub fn find_outer_contours(mask: &GrayImage) -> Vec<Vec<Point<i32>>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|contour| matches!(contour.border_type, BorderType::Outer))
        .map(|contour| contour.points)
        .collect()
}

/// Keep only the points where the traversal direction changes
pub fn compress_chain(contour: &[Point<i32>]) -> Vec<Point<i32>> {
    let n = contour.len();
    if n < 3 {
        return contour.to_vec();
    }

    (0..n)
        .filter(|&i| {
            let prev = contour[(i + n - 1) % n];
            let curr = contour[i];
            let next = contour[(i + 1) % n];
            let incoming = ((curr.x - prev.x).signum(), (curr.y - prev.y).signum());
            let outgoing = ((next.x - curr.x).signum(), (next.y - curr.y).signum());
            incoming != outgoing
        })
        .map(|i| contour[i])
        .collect()
}

/// Enclosed area of a closed outline
pub fn outline_area(outline: &[Point<i32>]) -> f64 {
    calculate_polygon_area(&flatten_outline(outline))
}

/// Douglas-Peucker reduction of a closed outline, without a repeated closing point
///
/// Reducing an already reduced outline with the same `epsilon` returns it unchanged.
pub fn simplify_outline(outline: &[Point<i32>], epsilon: f64) -> Vec<Point<i32>> {
    if outline.len() < 3 || epsilon <= 0.0 {
        return outline.to_vec();
    }
    let mut reduced = approximate_polygon_dp(outline, epsilon, true);
    if reduced.len() > 1 && reduced.first() == reduced.last() {
        reduced.pop();
    }
    reduced
}

fn flatten_outline(outline: &[Point<i32>]) -> Vec<f64> {
    outline
        .iter()
        .flat_map(|p| [f64::from(p.x), f64::from(p.y)])
        .collect()
}

/// Reduce a raster mask to one integer polygon `x1, y1, x2, y2, ...`
///
/// The mask is rescaled to `width` x `height` with nearest-neighbour
/// sampling, the outer border enclosing the largest area is selected and
/// approximated with a tolerance of `APPROXIMATION_RATIO` times its perimeter.
/// Empty masks and outlines that collapse below three points yield an empty polygon.
pub fn minimize_contour(mask: &GrayImage, width: u32, height: u32) -> Vec<f64> {
    let resized;
    let mask = if mask.dimensions() == (width, height) {
        mask
    } else {
        resized = imageops::resize(mask, width, height, FilterType::Nearest);
        &resized
    };

    let mut largest: Option<(f64, Vec<Point<i32>>)> = None;
    for contour in find_outer_contours(mask) {
        let outline = compress_chain(&contour);
        let area = outline_area(&outline);
        match &largest {
            Some((best, _)) if area <= *best => {}
            _ => largest = Some((area, outline)),
        }
    }

    let Some((_, outline)) = largest else {
        return Vec::new();
    };

    let epsilon = APPROXIMATION_RATIO * arc_length(&outline, true);
    let polygon = simplify_outline(&outline, epsilon);
    if polygon.len() < 3 {
        return Vec::new();
    }
    flatten_outline(&polygon)
}
