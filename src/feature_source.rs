// ===========================================================================
// Incoming DLM features and the sources that stream them per partition
// ===========================================================================
use anyhow::{Context, anyhow};
use geo::{Coord, LineString, Rect};
use serde_json::Value as JsonValue;
use std::fmt;
use tracing::{debug, warn};

use crate::attributes::{GroupPayload, Responsibility, SpeedLimit, SurfaceType, TravelDirection};
use crate::geometry_utils::{combined_envelope, start_coord};

/// One feature of the external dataset, with attributes already mapped onto
/// group payloads. Groups without a payload are treated as neutral.
#[derive(Debug, Clone, PartialEq)]
pub struct DlmFeature {
    pub external_id: String,
    pub geometry: LineString,
    pub routable: bool,
    pub name: Option<String>,
    pub number: Option<String>,
    pub payloads: Vec<GroupPayload>,
}

impl DlmFeature {
    pub fn new(external_id: impl Into<String>, geometry: LineString) -> Self {
        Self {
            external_id: external_id.into(),
            geometry,
            routable: true,
            name: None,
            number: None,
            payloads: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: GroupPayload) -> Self {
        self.payloads.retain(|p| p.kind() != payload.kind());
        self.payloads.push(payload);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn non_routable(mut self) -> Self {
        self.routable = false;
        self
    }
}

/// A square cell of the processing grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub row: usize,
    pub col: usize,
    pub bounds: Rect,
    last_row: bool,
    last_col: bool,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}c{}", self.row, self.col)
    }
}

impl Partition {
    /// Cut `extent` into squares of `size`, in row-major order.
    pub fn grid(extent: Rect, size: f64) -> Vec<Partition> {
        let cells = |span: f64| ((span / size).ceil() as usize).max(1);
        let rows = cells(extent.height());
        let cols = cells(extent.width());
        let origin = extent.min();

        let mut partitions = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                let min = Coord {
                    x: origin.x + col as f64 * size,
                    y: origin.y + row as f64 * size,
                };
                let max = Coord {
                    x: min.x + size,
                    y: min.y + size,
                };
                partitions.push(Partition {
                    row,
                    col,
                    bounds: Rect::new(min, max),
                    last_row: row + 1 == rows,
                    last_col: col + 1 == cols,
                });
            }
        }
        partitions
    }

    /// Half-open ownership so a point on a shared border belongs to exactly one cell.
    pub fn owns(&self, coord: Coord) -> bool {
        let (min, max) = (self.bounds.min(), self.bounds.max());
        let in_x = coord.x >= min.x && (coord.x < max.x || (self.last_col && coord.x <= max.x));
        let in_y = coord.y >= min.y && (coord.y < max.y || (self.last_row && coord.y <= max.y));
        in_x && in_y
    }
}

/// Streams features of the external dataset partition by partition.
pub trait FeatureSource {
    /// Bounding box of every feature, `None` when the source is empty.
    fn extent(&self) -> Option<Rect>;

    /// Features whose start point lies in `partition`, in dataset order.
    fn features_in(&mut self, partition: &Partition) -> anyhow::Result<Vec<DlmFeature>>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryFeatureSource {
    features: Vec<DlmFeature>,
}

impl InMemoryFeatureSource {
    pub fn new(features: Vec<DlmFeature>) -> Self {
        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl FeatureSource for InMemoryFeatureSource {
    fn extent(&self) -> Option<Rect> {
        combined_envelope(self.features.iter().map(|f| &f.geometry))
    }

    fn features_in(&mut self, partition: &Partition) -> anyhow::Result<Vec<DlmFeature>> {
        Ok(self
            .features
            .iter()
            .filter(|f| start_coord(&f.geometry).is_some_and(|c| partition.owns(c)))
            .cloned()
            .collect())
    }
}

/// Reads a GeoJSON `FeatureCollection` of line features.
///
/// Recognised properties: `id`, `name`, `number`, `routable`, `surface`
/// (or `surface_left`/`surface_right`), `speed_limit`, `responsibility`,
/// `direction`. Unknown values map to the neutral payload.
#[derive(Debug, Clone)]
pub struct GeoJsonFeatureSource {
    inner: InMemoryFeatureSource,
}

impl GeoJsonFeatureSource {
    pub fn from_geojson_str(text: &str) -> anyhow::Result<Self> {
        let geojson: geojson::GeoJson = text.parse().context("parsing GeoJSON")?;
        let collection = match geojson {
            geojson::GeoJson::FeatureCollection(collection) => collection,
            geojson::GeoJson::Feature(feature) => geojson::FeatureCollection {
                bbox: None,
                features: vec![feature],
                foreign_members: None,
            },
            geojson::GeoJson::Geometry(_) => {
                return Err(anyhow!("expected a FeatureCollection, got a bare geometry"));
            }
        };

        let mut features = Vec::with_capacity(collection.features.len());
        for (position, feature) in collection.features.into_iter().enumerate() {
            match Self::convert(feature) {
                Ok(Some(f)) => features.push(f),
                Ok(None) => debug!(position, "skipping feature without line geometry"),
                Err(e) => warn!(position, error = %e, "skipping malformed feature"),
            }
        }
        Ok(Self {
            inner: InMemoryFeatureSource::new(features),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn convert(feature: geojson::Feature) -> anyhow::Result<Option<DlmFeature>> {
        let external_id = match (&feature.id, feature.property("id")) {
            (Some(geojson::feature::Id::String(s)), _) => s.clone(),
            (Some(geojson::feature::Id::Number(n)), _) => n.to_string(),
            (None, Some(value)) => json_text(value).ok_or_else(|| anyhow!("empty id"))?,
            (None, None) => return Err(anyhow!("feature has no id")),
        };

        let Some(geometry) = feature.geometry.as_ref() else {
            return Ok(None);
        };
        let geometry: geo_types::Geometry<f64> = geometry
            .value
            .clone()
            .try_into()
            .with_context(|| format!("converting geometry of {external_id}"))?;
        let line = match geometry {
            geo_types::Geometry::LineString(line) => line,
            geo_types::Geometry::MultiLineString(mut multi) if multi.0.len() == 1 => multi.0.remove(0),
            _ => return Ok(None),
        };

        let text = |key: &str| feature.property(key).and_then(json_text);

        let mut dlm = DlmFeature::new(external_id, line);
        dlm.routable = feature
            .property("routable")
            .map(|v| match v {
                JsonValue::Bool(b) => *b,
                other => json_text(other).is_none_or(|t| t != "false" && t != "0"),
            })
            .unwrap_or(true);
        dlm.name = text("name");
        dlm.number = text("number");

        let surface = text("surface");
        let left = text("surface_left").or_else(|| surface.clone());
        let right = text("surface_right").or(surface);
        if left.is_some() || right.is_some() {
            dlm = dlm.with_payload(GroupPayload::Surface {
                left: left.as_deref().map(SurfaceType::parse).unwrap_or(SurfaceType::Unknown),
                right: right.as_deref().map(SurfaceType::parse).unwrap_or(SurfaceType::Unknown),
            });
        }
        if let Some(limit) = text("speed_limit") {
            dlm = dlm.with_payload(GroupPayload::SpeedLimit(SpeedLimit {
                kmh: limit.parse().ok(),
            }));
        }
        if let Some(maintainer) = text("responsibility") {
            dlm = dlm.with_payload(GroupPayload::Responsibility(Responsibility {
                maintainer: Some(maintainer),
            }));
        }
        if let Some(direction) = text("direction") {
            let direction = TravelDirection::parse(&direction);
            dlm = dlm.with_payload(GroupPayload::TravelDirection {
                left: direction,
                right: direction,
            });
        }
        Ok(Some(dlm))
    }
}

impl FeatureSource for GeoJsonFeatureSource {
    fn extent(&self) -> Option<Rect> {
        self.inner.extent()
    }

    fn features_in(&mut self, partition: &Partition) -> anyhow::Result<Vec<DlmFeature>> {
        self.inner.features_in(partition)
    }
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
