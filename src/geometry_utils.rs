use geo::{
    BoundingRect, Coord, Densify, Distance, Euclidean, Intersects, Length, LineInterpolatePoint,
    LineLocatePoint, LineString, MultiLineString, Point, Rect,
};

/// Where a point lands on a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineLocation {
    /// Position along the line as a share of its length, in `[0, 1]`.
    pub fraction: f64,
    /// Perpendicular distance from the point to the line.
    pub distance: f64,
    pub projected: Coord,
}

pub fn coord_distance(a: Coord, b: Coord) -> f64 {
    Euclidean.distance(Point::from(a), Point::from(b))
}

/// Euclidean length of a polyline in the working coordinate system.
pub fn line_length(line: &LineString) -> f64 {
    Euclidean.length(line)
}

pub fn start_coord(line: &LineString) -> Option<Coord> {
    line.0.first().copied()
}

pub fn end_coord(line: &LineString) -> Option<Coord> {
    line.0.last().copied()
}

/// Nearest point on `line` to `coord`, or `None` for lines without length.
pub fn locate(line: &LineString, coord: Coord) -> Option<LineLocation> {
    if line.0.len() < 2 || line_length(line) <= f64::EPSILON {
        return None;
    }
    let point = Point::from(coord);
    let fraction = line.line_locate_point(&point)?;
    let projected = line.line_interpolate_point(fraction)?;
    Some(LineLocation {
        fraction: fraction.clamp(0.0, 1.0),
        distance: Euclidean.distance(point, projected),
        projected: projected.0,
    })
}

pub fn point_at(line: &LineString, fraction: f64) -> Option<Coord> {
    line.line_interpolate_point(fraction.clamp(0.0, 1.0))
        .map(|p| p.0)
}

pub fn distance_to_line(line: &LineString, coord: Coord) -> f64 {
    match locate(line, coord) {
        Some(location) => location.distance,
        None => start_coord(line)
            .map(|start| coord_distance(start, coord))
            .unwrap_or(f64::INFINITY),
    }
}

pub fn reversed(line: &LineString) -> LineString {
    let mut coords = line.0.clone();
    coords.reverse();
    LineString::new(coords)
}

pub fn envelope(line: &LineString) -> Option<Rect> {
    line.bounding_rect()
}

pub fn expand_rect(rect: Rect, margin: f64) -> Rect {
    Rect::new(
        Coord {
            x: rect.min().x - margin,
            y: rect.min().y - margin,
        },
        Coord {
            x: rect.max().x + margin,
            y: rect.max().y + margin,
        },
    )
}

/// Smallest rectangle covering every line, `None` when there is nothing to cover.
pub fn combined_envelope<'a>(lines: impl IntoIterator<Item = &'a LineString>) -> Option<Rect> {
    MultiLineString::new(lines.into_iter().cloned().collect()).bounding_rect()
}

/// Boundary inclusive, unlike `Contains` on `Rect`.
pub fn rect_contains(rect: &Rect, coord: Coord) -> bool {
    rect.intersects(&coord)
}

/// Round a fractional position to `decimals` places.
pub fn round_fraction(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Densify a polyline by adding points so no step exceeds `max_spacing`.
pub fn densify(line: &LineString, max_spacing: f64) -> Vec<Coord> {
    if line.0.len() < 2 || max_spacing <= 0.0 {
        return line.0.clone();
    }
    Euclidean.densify(line, max_spacing).0
}

/// Largest distance from any (densified) vertex of `source` to `target`.
pub fn directed_hausdorff(source: &LineString, target: &LineString, spacing: f64) -> f64 {
    densify(source, spacing)
        .into_iter()
        .map(|c| distance_to_line(target, c))
        .fold(0.0, f64::max)
}

/// True when `inner` never leaves the corridor of width `buffer` around `outer`.
pub fn within_buffer(inner: &LineString, outer: &LineString, buffer: f64) -> bool {
    directed_hausdorff(inner, outer, (buffer / 2.0).max(1.0)) <= buffer
}
