use serde::{Deserialize, Serialize};

/// Tolerances and sizes used by every stage of the reimport.
///
/// All distances are in units of the working planar coordinate system
/// (metres for the projected DLM data).
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReimportConfig {
    /// Radius inside which an endpoint resolves to an existing node.
    pub snap_tolerance: f64,
    /// Wider radius used to re-resolve endpoints of a topological update.
    pub topological_search_radius: f64,
    /// Max distance a segment boundary may lie off the new geometry and still project.
    pub projection_tolerance: f64,
    /// Minimum start/end separation, as a share of length, to trust the stationing direction.
    pub direction_ambiguity_ratio: f64,
    /// Corridor width around an old edge that a split chain has to stay inside.
    pub split_buffer: f64,
    /// DBSCAN radius for duplicate node detection.
    pub merge_radius: f64,
    /// DBSCAN core point threshold (the point itself included).
    pub merge_min_points: usize,
    /// Edge length of a square processing partition.
    pub partition_size: f64,
    /// Decimal places kept for fractional positions.
    pub fraction_decimals: u32,
}

impl Default for ReimportConfig {
    fn default() -> Self {
        Self {
            snap_tolerance: 1.0,
            topological_search_radius: 2.0,
            projection_tolerance: 15.0,
            direction_ambiguity_ratio: 0.05,
            split_buffer: 15.0,
            merge_radius: 1.0,
            merge_min_points: 2,
            partition_size: 10_000.0,
            fraction_decimals: 2,
        }
    }
}

impl ReimportConfig {
    /// Parse a RON document; omitted fields keep their defaults.
    pub fn from_ron_str(text: &str) -> anyhow::Result<Self> {
        let config: ReimportConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let positive = [
            ("snap_tolerance", self.snap_tolerance),
            ("topological_search_radius", self.topological_search_radius),
            ("projection_tolerance", self.projection_tolerance),
            ("direction_ambiguity_ratio", self.direction_ambiguity_ratio),
            ("split_buffer", self.split_buffer),
            ("merge_radius", self.merge_radius),
            ("partition_size", self.partition_size),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                anyhow::bail!("{name} must be a positive finite number, got {value}");
            }
        }
        if self.direction_ambiguity_ratio >= 0.5 {
            anyhow::bail!(
                "direction_ambiguity_ratio must be below 0.5, got {}",
                self.direction_ambiguity_ratio
            );
        }
        if self.merge_min_points < 2 {
            anyhow::bail!("merge_min_points must be at least 2");
        }
        if self.topological_search_radius < self.snap_tolerance {
            anyhow::bail!("topological_search_radius must not be smaller than snap_tolerance");
        }
        Ok(())
    }

    /// Largest radius any endpoint lookup can use.
    pub fn max_search_radius(&self) -> f64 {
        self.snap_tolerance
            .max(self.topological_search_radius)
            .max(self.split_buffer)
    }
}
