// ===========================================================================
// Linear attribute projection
// ===========================================================================
//
// Moves linearly referenced segments from an edge's old geometry onto a new
// geometry. Boundaries are projected point-wise (old fraction -> old point ->
// nearest point on the new line -> new fraction), then the result is
// stitched back into a gap-free cover of [0, 1].
//
// The same routine clips segments onto one replacement edge of a split: the
// segments are first cut to the window of the old line the replacement
// occupies, then projected onto the replacement's geometry. Only pieces cut
// at a window edge are subject to the minimum length; a short segment that
// was short on the old edge too stays.
// ===========================================================================

use geo::LineString;
use tracing::trace;

use crate::attributes::{
    AttributeGroup, EdgeAttributes, Interval, LinearlyReferenced, Payload, SegmentList, Sided,
};
use crate::config::ReimportConfig;
use crate::error::{ReimportError, Result};
use crate::geometry_utils::{end_coord, line_length, locate, point_at, round_fraction, start_coord};

/// Traversal sense of a new geometry relative to the geometry it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationingDirection {
    Forward,
    Reversed,
}

impl StationingDirection {
    pub fn is_reversed(&self) -> bool {
        matches!(self, StationingDirection::Reversed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedAttributes {
    pub attributes: EdgeAttributes,
    pub direction: StationingDirection,
}

pub struct LinearAttributeProjector<'a> {
    config: &'a ReimportConfig,
}

impl<'a> LinearAttributeProjector<'a> {
    pub fn new(config: &'a ReimportConfig) -> Self {
        Self { config }
    }

    /// Decide whether `new` runs the same way as `old`.
    ///
    /// Projects the endpoints of each line onto the other one and trusts
    /// whichever line separates them more; below the configured share of
    /// length on both lines the direction is ambiguous.
    pub fn determine_direction(
        &self,
        old: &LineString,
        new: &LineString,
    ) -> Result<StationingDirection> {
        let ambiguous = |old_separation: f64, new_separation: f64| {
            ReimportError::StationingAmbiguous {
                old_separation,
                new_separation,
            }
        };

        let (Some(new_start), Some(new_end), Some(old_start), Some(old_end)) = (
            start_coord(new),
            end_coord(new),
            start_coord(old),
            end_coord(old),
        ) else {
            return Err(ambiguous(0.0, 0.0));
        };

        let on_old = locate(old, new_start).zip(locate(old, new_end));
        let on_new = locate(new, old_start).zip(locate(new, old_end));

        let old_separation = on_old
            .map(|(s, e)| e.fraction - s.fraction)
            .unwrap_or(0.0);
        let new_separation = on_new
            .map(|(s, e)| e.fraction - s.fraction)
            .unwrap_or(0.0);

        let threshold = self.config.direction_ambiguity_ratio;
        let decisive = if old_separation.abs() >= new_separation.abs() {
            old_separation
        } else {
            new_separation
        };

        if decisive.abs() < threshold {
            return Err(ambiguous(old_separation.abs(), new_separation.abs()));
        }

        Ok(if decisive > 0.0 {
            StationingDirection::Forward
        } else {
            StationingDirection::Reversed
        })
    }

    /// Re-project every group of `attributes` from `old` onto `new`.
    ///
    /// Side-dependent groups swap sides and direction-of-travel payloads
    /// flip when the new geometry runs the other way. Protected fields are
    /// carried over untouched.
    pub fn reproject_attributes(
        &self,
        attributes: &EdgeAttributes,
        old: &LineString,
        new: &LineString,
    ) -> Result<ProjectedAttributes> {
        let direction = self.determine_direction(old, new)?;
        let groups = attributes
            .groups
            .iter()
            .map(|group| self.transfer_group(group, old, new, Interval::FULL, direction))
            .collect::<Result<Vec<_>>>()?;
        Ok(ProjectedAttributes {
            attributes: EdgeAttributes {
                name: attributes.name.clone(),
                number: attributes.number.clone(),
                groups,
            },
            direction,
        })
    }

    /// Cut every group to `window` of `old` and lay it onto `replacement`.
    pub fn clip_attributes(
        &self,
        attributes: &EdgeAttributes,
        old: &LineString,
        replacement: &LineString,
        window: Interval,
        direction: StationingDirection,
    ) -> Result<EdgeAttributes> {
        let groups = attributes
            .groups
            .iter()
            .map(|group| self.transfer_group(group, old, replacement, window, direction))
            .collect::<Result<Vec<_>>>()?;
        Ok(EdgeAttributes {
            name: attributes.name.clone(),
            number: attributes.number.clone(),
            groups,
        })
    }

    pub fn transfer_group(
        &self,
        group: &AttributeGroup,
        old: &LineString,
        new: &LineString,
        window: Interval,
        direction: StationingDirection,
    ) -> Result<AttributeGroup> {
        Ok(match group {
            AttributeGroup::Surface(sided) => {
                AttributeGroup::Surface(self.transfer_sided(sided, old, new, window, direction)?)
            }
            AttributeGroup::SpeedLimit(list) => {
                AttributeGroup::SpeedLimit(self.transfer_list(list, old, new, window, direction)?)
            }
            AttributeGroup::Responsibility(list) => AttributeGroup::Responsibility(
                self.transfer_list(list, old, new, window, direction)?,
            ),
            AttributeGroup::TravelDirection(sided) => AttributeGroup::TravelDirection(
                self.transfer_sided(sided, old, new, window, direction)?,
            ),
        })
    }

    fn transfer_sided<P: Payload>(
        &self,
        sided: &Sided<P>,
        old: &LineString,
        new: &LineString,
        window: Interval,
        direction: StationingDirection,
    ) -> Result<Sided<P>> {
        let left = self.transfer_list(&sided.left, old, new, window, direction)?;
        let right = self.transfer_list(&sided.right, old, new, window, direction)?;
        Ok(if direction.is_reversed() {
            Sided {
                left: right,
                right: left,
            }
        } else {
            Sided { left, right }
        })
    }

    fn transfer_list<P: Payload>(
        &self,
        list: &SegmentList<P>,
        old: &LineString,
        new: &LineString,
        window: Interval,
        direction: StationingDirection,
    ) -> Result<SegmentList<P>> {
        let clipped = clip_to_window(&list.0, window);
        Ok(SegmentList(self.project_cut(&clipped, old, new, direction)?))
    }

    /// Project `segments` (fractions of `old`) onto `new`.
    ///
    /// Always returns a gap-free cover of `[0, 1]`; when nothing survives the
    /// projection, a single neutral segment.
    pub fn project<T: LinearlyReferenced>(
        &self,
        segments: &[T],
        old: &LineString,
        new: &LineString,
        direction: StationingDirection,
    ) -> Result<Vec<T>> {
        let uncut: Vec<(T, bool)> = segments.iter().map(|s| (s.clone(), false)).collect();
        self.project_cut(&uncut, old, new, direction)
    }

    /// Like [`Self::project`], with every segment flagged by whether a
    /// split window cut it.
    fn project_cut<T: LinearlyReferenced>(
        &self,
        segments: &[(T, bool)],
        old: &LineString,
        new: &LineString,
        direction: StationingDirection,
    ) -> Result<Vec<T>> {
        let decimals = self.config.fraction_decimals;
        let mut ordered: Vec<(T, bool)> = segments.to_vec();
        ordered.sort_by(|(a, _), (b, _)| a.interval().start.total_cmp(&b.interval().start));

        let (before_start, after_end) = match direction {
            StationingDirection::Forward => (0.0, 1.0),
            StationingDirection::Reversed => (1.0, 0.0),
        };

        let mut pieces: Vec<(T, bool)> = Vec::with_capacity(ordered.len());
        let mut last_boundary: Option<f64> = None;

        for (segment, cut) in &ordered {
            let interval = segment.interval();
            let projected_start = self.project_boundary(old, new, interval.start);
            let projected_end = self.project_boundary(old, new, interval.end);

            if projected_start.is_none() && projected_end.is_none() {
                trace!(?interval, "segment lies entirely off the new geometry");
                continue;
            }

            let start = projected_start.or(last_boundary).unwrap_or(before_start);
            let end = projected_end.unwrap_or(after_end);
            last_boundary = Some(end);

            let (a, b, piece) = match direction {
                StationingDirection::Forward => (start, end, segment.clone()),
                StationingDirection::Reversed => (end, start, segment.flipped()),
            };
            let (a, b) = (round_fraction(a, decimals), round_fraction(b, decimals));

            if a == b {
                continue;
            }
            if a > b {
                return Err(ReimportError::ProjectionOrderReversed { start: a, end: b });
            }
            pieces.push((piece.with_interval(Interval::new(a, b)), *cut));
        }

        Ok(self.stitch(pieces, line_length(new)))
    }

    fn project_boundary(&self, old: &LineString, new: &LineString, fraction: f64) -> Option<f64> {
        let point = point_at(old, fraction)?;
        let location = locate(new, point)?;
        (location.distance <= self.config.projection_tolerance).then_some(location.fraction)
    }

    /// Restore the "sorted, gap free, covers [0, 1]" invariant.
    fn stitch<T: LinearlyReferenced>(&self, mut pieces: Vec<(T, bool)>, length: f64) -> Vec<T> {
        pieces.sort_by(|(a, _), (b, _)| a.interval().start.total_cmp(&b.interval().start));

        // Overlaps: later pieces start where the previous one ends.
        let mut resolved: Vec<(T, bool)> = Vec::with_capacity(pieces.len());
        for (piece, cut) in pieces {
            let mut interval = piece.interval();
            if let Some((previous, _)) = resolved.last() {
                interval.start = interval.start.max(previous.interval().end);
            }
            if interval.start < interval.end {
                resolved.push((piece.with_interval(interval), cut));
            }
        }

        // Window remnants shorter than the projection tolerance belong to
        // the neighbouring replacement edge; their neighbours absorb them.
        if length > f64::EPSILON {
            let sliver = self.config.projection_tolerance / length;
            while resolved.len() > 1 {
                let shortest = resolved
                    .iter()
                    .enumerate()
                    .filter(|(_, (p, cut))| *cut && p.interval().length() < sliver)
                    .min_by(|(_, (a, _)), (_, (b, _))| {
                        a.interval().length().total_cmp(&b.interval().length())
                    })
                    .map(|(i, _)| i);
                match shortest {
                    Some(index) => {
                        resolved.remove(index);
                    }
                    None => break,
                }
            }
        }

        let resolved: Vec<T> = resolved.into_iter().map(|(piece, _)| piece).collect();
        if resolved.is_empty() {
            return vec![T::neutral(Interval::FULL)];
        }

        // Leading and trailing gaps are either within tolerance (snap) or
        // backfilled by the adjacent payload; both end at 0 and 1.
        let count = resolved.len();
        let mut stitched: Vec<T> = Vec::with_capacity(count);
        for (i, piece) in resolved.iter().enumerate() {
            let mut interval = piece.interval();
            if i == 0 {
                interval.start = 0.0;
            }
            if i + 1 == count {
                interval.end = 1.0;
            } else {
                interval.end = resolved[i + 1].interval().start;
            }
            stitched.push(piece.with_interval(interval));
        }
        stitched
    }
}

/// Cut segments to `window`, keeping fractions relative to the full line.
/// The flag marks segments the window cut short.
fn clip_to_window<T: LinearlyReferenced>(segments: &[T], window: Interval) -> Vec<(T, bool)> {
    segments
        .iter()
        .filter_map(|segment| {
            let interval = segment.interval();
            let start = interval.start.max(window.start);
            let end = interval.end.min(window.end);
            let cut = start > interval.start || end < interval.end;
            (start < end).then(|| (segment.with_interval(Interval::new(start, end)), cut))
        })
        .collect()
}
