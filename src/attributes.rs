// ===========================================================================
// Linearly referenced attribute groups
// ===========================================================================
//
// Every group is a list of segments whose `[start, end)` intervals cover
// `[0, 1]` of the edge geometry without gaps or overlaps. Side-dependent
// groups keep one such list per side of the road.
// ===========================================================================

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

const COVERAGE_EPSILON: f64 = 1e-9;

/// Half-open fractional interval `[start, end)` along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start: f64,
    pub end: f64,
}

impl Interval {
    pub const FULL: Interval = Interval {
        start: 0.0,
        end: 1.0,
    };

    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    /// Same stretch of road seen from the opposite end: `[s, e] -> [1-e, 1-s]`.
    pub fn reversed(&self) -> Self {
        Self {
            start: 1.0 - self.end,
            end: 1.0 - self.start,
        }
    }
}

/// Value carried by a segment.
pub trait Payload: Clone + PartialEq + Debug {
    /// Value used when nothing is known about a stretch.
    fn neutral() -> Self;

    /// The value as seen when the stationing direction is reversed.
    fn reversed(&self) -> Self {
        self.clone()
    }
}

/// Anything that occupies an interval along an edge.
pub trait LinearlyReferenced: Clone + Debug {
    fn interval(&self) -> Interval;
    fn with_interval(&self, interval: Interval) -> Self;
    fn neutral(interval: Interval) -> Self;
    /// Copy of `self` for a reversed stationing direction (interval untouched).
    fn flipped(&self) -> Self;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment<P> {
    pub interval: Interval,
    pub payload: P,
}

impl<P> Segment<P> {
    pub fn new(start: f64, end: f64, payload: P) -> Self {
        Self {
            interval: Interval::new(start, end),
            payload,
        }
    }
}

impl<P: Payload> LinearlyReferenced for Segment<P> {
    fn interval(&self) -> Interval {
        self.interval
    }

    fn with_interval(&self, interval: Interval) -> Self {
        Self {
            interval,
            payload: self.payload.clone(),
        }
    }

    fn neutral(interval: Interval) -> Self {
        Self {
            interval,
            payload: P::neutral(),
        }
    }

    fn flipped(&self) -> Self {
        Self {
            interval: self.interval,
            payload: self.payload.reversed(),
        }
    }
}

/// Ordered segments of one group (or one side of a side-dependent group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentList<P>(pub Vec<Segment<P>>);

impl<P: Payload> SegmentList<P> {
    pub fn full_span(payload: P) -> Self {
        Self(vec![Segment {
            interval: Interval::FULL,
            payload,
        }])
    }

    pub fn neutral() -> Self {
        Self::full_span(P::neutral())
    }

    pub fn segments(&self) -> &[Segment<P>] {
        &self.0
    }

    pub fn is_neutral(&self) -> bool {
        self.0.iter().all(|s| s.payload == P::neutral())
    }

    /// Segments are sorted, non-empty, gap free and cover exactly `[0, 1]`.
    pub fn covers_unit_interval(&self) -> bool {
        covers_unit_interval(&self.0)
    }

    pub fn payloads(&self) -> Vec<&P> {
        self.0.iter().map(|s| &s.payload).collect()
    }
}

/// Shared coverage check for anything linearly referenced.
pub fn covers_unit_interval<T: LinearlyReferenced>(segments: &[T]) -> bool {
    let Some(first) = segments.first() else {
        return false;
    };
    if first.interval().start.abs() > COVERAGE_EPSILON {
        return false;
    }
    let mut cursor = 0.0;
    for segment in segments {
        let interval = segment.interval();
        if (interval.start - cursor).abs() > COVERAGE_EPSILON {
            return false;
        }
        if interval.length() <= COVERAGE_EPSILON {
            return false;
        }
        cursor = interval.end;
    }
    (cursor - 1.0).abs() <= COVERAGE_EPSILON
}

/// A side-dependent group: one segment list per side of the road,
/// left and right as seen in the edge's stationing direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sided<P> {
    pub left: SegmentList<P>,
    pub right: SegmentList<P>,
}

impl<P: Payload> Sided<P> {
    pub fn both(payload: P) -> Self {
        Self {
            left: SegmentList::full_span(payload.clone()),
            right: SegmentList::full_span(payload),
        }
    }

    pub fn neutral() -> Self {
        Self::both(P::neutral())
    }
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurfaceType {
    Unknown,
    Asphalt,
    Concrete,
    Paving,
    Gravel,
    Unpaved,
}

impl Payload for SurfaceType {
    fn neutral() -> Self {
        SurfaceType::Unknown
    }
}

impl SurfaceType {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "asphalt" => SurfaceType::Asphalt,
            "concrete" => SurfaceType::Concrete,
            "paving" | "paving_stones" | "sett" => SurfaceType::Paving,
            "gravel" | "fine_gravel" => SurfaceType::Gravel,
            "unpaved" | "dirt" | "ground" => SurfaceType::Unpaved,
            _ => SurfaceType::Unknown,
        }
    }
}

/// Posted limit in km/h, `None` when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SpeedLimit {
    pub kmh: Option<u16>,
}

impl Payload for SpeedLimit {
    fn neutral() -> Self {
        SpeedLimit { kmh: None }
    }
}

/// Body responsible for maintaining a stretch of road.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Responsibility {
    pub maintainer: Option<String>,
}

impl Payload for Responsibility {
    fn neutral() -> Self {
        Responsibility { maintainer: None }
    }
}

/// Allowed direction of travel relative to the edge's stationing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TravelDirection {
    Both,
    Forward,
    Backward,
    Closed,
}

impl Payload for TravelDirection {
    fn neutral() -> Self {
        TravelDirection::Both
    }

    fn reversed(&self) -> Self {
        match self {
            TravelDirection::Forward => TravelDirection::Backward,
            TravelDirection::Backward => TravelDirection::Forward,
            other => *other,
        }
    }
}

impl TravelDirection {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "forward" | "yes" | "oneway" => TravelDirection::Forward,
            "backward" | "-1" => TravelDirection::Backward,
            "closed" | "no_access" => TravelDirection::Closed,
            _ => TravelDirection::Both,
        }
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttributeGroupKind {
    Surface,
    SpeedLimit,
    Responsibility,
    TravelDirection,
}

impl AttributeGroupKind {
    pub const ALL: [AttributeGroupKind; 4] = [
        AttributeGroupKind::Surface,
        AttributeGroupKind::SpeedLimit,
        AttributeGroupKind::Responsibility,
        AttributeGroupKind::TravelDirection,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeGroup {
    Surface(Sided<SurfaceType>),
    SpeedLimit(SegmentList<SpeedLimit>),
    Responsibility(SegmentList<Responsibility>),
    TravelDirection(Sided<TravelDirection>),
}

/// A single full-span value for one group, as delivered by attribute mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupPayload {
    Surface {
        left: SurfaceType,
        right: SurfaceType,
    },
    SpeedLimit(SpeedLimit),
    Responsibility(Responsibility),
    TravelDirection {
        left: TravelDirection,
        right: TravelDirection,
    },
}

impl GroupPayload {
    pub fn kind(&self) -> AttributeGroupKind {
        match self {
            GroupPayload::Surface { .. } => AttributeGroupKind::Surface,
            GroupPayload::SpeedLimit(_) => AttributeGroupKind::SpeedLimit,
            GroupPayload::Responsibility(_) => AttributeGroupKind::Responsibility,
            GroupPayload::TravelDirection { .. } => AttributeGroupKind::TravelDirection,
        }
    }
}

impl AttributeGroup {
    pub fn neutral(kind: AttributeGroupKind) -> Self {
        match kind {
            AttributeGroupKind::Surface => AttributeGroup::Surface(Sided::neutral()),
            AttributeGroupKind::SpeedLimit => AttributeGroup::SpeedLimit(SegmentList::neutral()),
            AttributeGroupKind::Responsibility => {
                AttributeGroup::Responsibility(SegmentList::neutral())
            }
            AttributeGroupKind::TravelDirection => {
                AttributeGroup::TravelDirection(Sided::neutral())
            }
        }
    }

    pub fn full_span(payload: GroupPayload) -> Self {
        match payload {
            GroupPayload::Surface { left, right } => AttributeGroup::Surface(Sided {
                left: SegmentList::full_span(left),
                right: SegmentList::full_span(right),
            }),
            GroupPayload::SpeedLimit(limit) => {
                AttributeGroup::SpeedLimit(SegmentList::full_span(limit))
            }
            GroupPayload::Responsibility(responsibility) => {
                AttributeGroup::Responsibility(SegmentList::full_span(responsibility))
            }
            GroupPayload::TravelDirection { left, right } => {
                AttributeGroup::TravelDirection(Sided {
                    left: SegmentList::full_span(left),
                    right: SegmentList::full_span(right),
                })
            }
        }
    }

    pub fn kind(&self) -> AttributeGroupKind {
        match self {
            AttributeGroup::Surface(_) => AttributeGroupKind::Surface,
            AttributeGroup::SpeedLimit(_) => AttributeGroupKind::SpeedLimit,
            AttributeGroup::Responsibility(_) => AttributeGroupKind::Responsibility,
            AttributeGroup::TravelDirection(_) => AttributeGroupKind::TravelDirection,
        }
    }

    pub fn covers_unit_interval(&self) -> bool {
        match self {
            AttributeGroup::Surface(sided) => {
                sided.left.covers_unit_interval() && sided.right.covers_unit_interval()
            }
            AttributeGroup::SpeedLimit(list) => list.covers_unit_interval(),
            AttributeGroup::Responsibility(list) => list.covers_unit_interval(),
            AttributeGroup::TravelDirection(sided) => {
                sided.left.covers_unit_interval() && sided.right.covers_unit_interval()
            }
        }
    }

    pub fn is_neutral(&self) -> bool {
        match self {
            AttributeGroup::Surface(sided) => sided.left.is_neutral() && sided.right.is_neutral(),
            AttributeGroup::SpeedLimit(list) => list.is_neutral(),
            AttributeGroup::Responsibility(list) => list.is_neutral(),
            AttributeGroup::TravelDirection(sided) => {
                sided.left.is_neutral() && sided.right.is_neutral()
            }
        }
    }
}

/// Everything attached to an edge besides geometry and topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttributes {
    /// Road name. Protected: survives attribute resets.
    pub name: Option<String>,
    /// Road number. Protected: survives attribute resets.
    pub number: Option<String>,
    pub groups: Vec<AttributeGroup>,
}

impl Default for EdgeAttributes {
    fn default() -> Self {
        Self {
            name: None,
            number: None,
            groups: AttributeGroupKind::ALL
                .iter()
                .map(|kind| AttributeGroup::neutral(*kind))
                .collect(),
        }
    }
}

impl EdgeAttributes {
    /// One full-span group per kind, taken from `payloads` or neutral if absent.
    pub fn from_payloads(
        name: Option<String>,
        number: Option<String>,
        payloads: &[GroupPayload],
    ) -> Self {
        let groups = AttributeGroupKind::ALL
            .iter()
            .map(|kind| {
                payloads
                    .iter()
                    .find(|p| p.kind() == *kind)
                    .map(|p| AttributeGroup::full_span(p.clone()))
                    .unwrap_or_else(|| AttributeGroup::neutral(*kind))
            })
            .collect();
        Self {
            name,
            number,
            groups,
        }
    }

    pub fn group(&self, kind: AttributeGroupKind) -> Option<&AttributeGroup> {
        self.groups.iter().find(|g| g.kind() == kind)
    }

    /// Drop every linear attribute, keeping only the protected name and number.
    pub fn reset_to_default(&mut self) {
        let name = self.name.take();
        let number = self.number.take();
        *self = EdgeAttributes {
            name,
            number,
            ..Default::default()
        };
    }

    pub fn has_non_default_groups(&self) -> bool {
        self.groups.iter().any(|g| !g.is_neutral())
    }

    pub fn all_groups_cover_unit_interval(&self) -> bool {
        self.groups.iter().all(|g| g.covers_unit_interval())
    }

    /// Replace protected fields with incoming values when those are non-empty.
    /// Returns true when anything changed.
    pub fn refresh_protected(&mut self, name: Option<&str>, number: Option<&str>) -> bool {
        let mut changed = false;
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            if self.name.as_deref() != Some(name) {
                self.name = Some(name.to_string());
                changed = true;
            }
        }
        if let Some(number) = number.filter(|n| !n.trim().is_empty()) {
            if self.number.as_deref() != Some(number) {
                self.number = Some(number.to_string());
                changed = true;
            }
        }
        changed
    }
}
