//! Core engine for sprawl: influence fields over a bounded plane, and the
//! settlement world that grows by hill-climbing those fields.
//!
//! The moving parts, bottom up:
//!
//! - [`InfluenceFunction`]: closed-form distance-response curves built from
//!   validated breakpoints.
//! - [`Influence`] implementations ([`DistanceInfluence`], [`SlopeInfluence`]):
//!   score a candidate footprint at a position, caching spatial indexes per
//!   invalidation epoch.
//! - [`InfluenceField`]: a weighted bundle of influences with veto semantics,
//!   plus the hill-climbing site search that walks the field.
//! - [`World`]: border, terrain rasters, the agent registry, named influence
//!   fields, and the step loop that places new dwellings.
//!
//! Scores live in `[-1, 1]`. A raw influence value at or below
//! [`VETO_SCORE`] marks a site as unbuildable and short-circuits the whole
//! aggregate, so hard constraints (over a river, off the terrain raster,
//! too steep) cannot be averaged away by friendly neighbours.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::f64::consts::{PI, TAU};
use std::fmt;
use std::sync::Arc;

use geo::{
    Area, BoundingRect, Centroid, Contains, EuclideanDistance, Geometry, LineString, MultiPolygon,
    Point, Polygon, Rect, Rotate, Translate, coord,
};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use sprawl_index::{ProximityIndex, RTreeIndex};
use thiserror::Error;
use tracing::{debug, info, warn};

new_key_type! {
    /// Stable handle for an agent in the world registry.
    pub struct AgentId;
}

/// Aggregate score marking a site as unbuildable.
pub const VETO_SCORE: f64 = -1.0;

/// Random start candidates a search samples before giving up.
pub const DEFAULT_START_TRIES: u32 = 100;

/// Steepest ground normally considered buildable, in radians.
pub const DEFAULT_MAX_SLOPE: f64 = PI / 8.0;

/// Footprint edge used when rasterising a field for inspection.
pub const PREVIEW_PROBE_EDGE: f64 = 4.5;

/// Compass points examined around the current position at each climb.
const RING_NEIGHBOURS: u32 = 8;

/// Footprints regenerated before a dwelling build gives up.
const DWELLING_BUILD_TRIES: u32 = 5;

const DWELLING_RATIO_MIN: f64 = 2.0 / 3.0;
const DWELLING_RATIO_MAX: f64 = 1.5;

const COORD_SCALE: f64 = 1e15;

/// Rounds away sub-femto trigonometric noise so that axis-aligned ring
/// neighbours land on exact coordinates.
fn round15(value: f64) -> f64 {
    (value * COORD_SCALE).round() / COORD_SCALE
}

/// Scaled tanh ramp: sweeps from roughly -1 to roughly 1 as `x` crosses
/// `[-width / 2, width / 2]`.
fn tanh_ramp(width: f64, x: f64) -> f64 {
    (x * TAU / width).tanh()
}

/// Discrete simulation time, one unit per world step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick(pub u64);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while building influence curves.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InfluenceError {
    /// Breakpoints must satisfy `l_min <= l_zero <= l_max`.
    #[error("influence breakpoints are not in ascending order: {breakpoints:?}")]
    BreakpointsNotAscending { breakpoints: Vec<f64> },
    /// Three-breakpoint curves need their middle breakpoint.
    #[error("curve `{curve}` needs an l_zero breakpoint")]
    MissingBreakpoint { curve: &'static str },
    /// Two-breakpoint curves must not be given a middle breakpoint.
    #[error("curve `{curve}` does not use an l_zero breakpoint")]
    ExtraBreakpoint { curve: &'static str },
}

/// Errors raised by hill-climbing site searches.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SearchError {
    /// Every sampled start candidate scored as unbuildable.
    #[error("no valid start point after {attempts} attempts")]
    NoValidStartPoint { attempts: u32 },
}

/// Errors surfaced by world construction and the world API.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorldError {
    #[error("configuration rejected: {0}")]
    InvalidConfig(&'static str),
    #[error("unknown influence set `{0}`")]
    UnknownInfluence(String),
    #[error("unknown raster `{0}`")]
    UnknownRaster(String),
    /// Every regenerated footprint landed partly outside the border.
    #[error("no buildable placement after {tries} footprint attempts")]
    ImpossibleBuild { tries: u32 },
    #[error(transparent)]
    Influence(#[from] InfluenceError),
    #[error(transparent)]
    Search(#[from] SearchError),
}

// ---------------------------------------------------------------------------
// Influence curves
// ---------------------------------------------------------------------------

/// A distance-response curve built from validated breakpoints.
///
/// All four kinds map a non-negative scalar (a planar distance, or a slope
/// in radians) onto `[-1, 1]`, with smooth tanh ramps joining the plateaus.
/// Ramp endpoints are asymptotic: a ramp reaches about `0.996` of its
/// plateau at the breakpoint, not the plateau itself. Constructors reject
/// breakpoints that are not in ascending order; equal neighbours are legal
/// and collapse the ramp between them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InfluenceFunction {
    /// Repulsive at contact, peaks near `l_zero`, fades to neutral by `l_max`.
    ///
    /// The classic neighbour curve: don't touch me, settle nearby, ignore
    /// me from far away.
    AttractionRepulsion { l_min: f64, l_zero: f64, l_max: f64 },
    /// Full attraction below `l_min`, fading to full repulsion past `l_max`.
    OpenDistance { l_min: f64, l_max: f64 },
    /// As [`OpenDistance`], but also fully repulsive below `l_min`.
    CloseDistance { l_min: f64, l_max: f64 },
    /// Attractive only inside `(l_min, l_max)`, peaking near `l_zero`.
    Balance { l_min: f64, l_zero: f64, l_max: f64 },
}

fn ensure_ascending(breakpoints: &[f64]) -> Result<(), InfluenceError> {
    if breakpoints.windows(2).all(|pair| pair[0] <= pair[1]) {
        Ok(())
    } else {
        Err(InfluenceError::BreakpointsNotAscending {
            breakpoints: breakpoints.to_vec(),
        })
    }
}

impl InfluenceFunction {
    pub fn attraction_repulsion(l_min: f64, l_zero: f64, l_max: f64) -> Result<Self, InfluenceError> {
        ensure_ascending(&[l_min, l_zero, l_max])?;
        Ok(Self::AttractionRepulsion { l_min, l_zero, l_max })
    }

    pub fn open_distance(l_min: f64, l_max: f64) -> Result<Self, InfluenceError> {
        ensure_ascending(&[l_min, l_max])?;
        Ok(Self::OpenDistance { l_min, l_max })
    }

    pub fn close_distance(l_min: f64, l_max: f64) -> Result<Self, InfluenceError> {
        ensure_ascending(&[l_min, l_max])?;
        Ok(Self::CloseDistance { l_min, l_max })
    }

    pub fn balance(l_min: f64, l_zero: f64, l_max: f64) -> Result<Self, InfluenceError> {
        ensure_ascending(&[l_min, l_zero, l_max])?;
        Ok(Self::Balance { l_min, l_zero, l_max })
    }

    /// Evaluates the curve at a distance (or slope).
    #[must_use]
    pub fn value(&self, distance: f64) -> f64 {
        match *self {
            Self::AttractionRepulsion { l_min, l_zero, l_max } => {
                if distance <= l_min {
                    -1.0
                } else if distance < l_zero {
                    tanh_ramp(l_zero - l_min, distance - l_min) * 2.0 - 1.0
                } else if distance < l_max {
                    let width = l_max - l_zero;
                    -tanh_ramp(width, distance - l_zero - width / 2.0) / 2.0 + 0.5
                } else {
                    0.0
                }
            }
            Self::OpenDistance { l_min, l_max } => {
                if distance < l_min {
                    1.0
                } else if distance < l_max {
                    let width = l_max - l_min;
                    -tanh_ramp(width, distance - l_min - width / 2.0)
                } else {
                    -1.0
                }
            }
            Self::CloseDistance { l_min, l_max } => {
                if distance < l_min {
                    -1.0
                } else if distance < l_max {
                    let width = l_max - l_min;
                    -tanh_ramp(width, distance - l_min - width / 2.0)
                } else {
                    -1.0
                }
            }
            Self::Balance { l_min, l_zero, l_max } => {
                if distance <= l_min {
                    -1.0
                } else if distance < l_zero {
                    let width = l_zero - l_min;
                    tanh_ramp(width, distance - l_min - width / 2.0)
                } else if distance < l_max {
                    let width = l_max - l_zero;
                    -tanh_ramp(width, distance - l_zero - width / 2.0)
                } else {
                    -1.0
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Broad classes of spatial agents influences can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Dwelling,
    Road,
    River,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AgentKind::Dwelling => "dwelling",
            AgentKind::Road => "road",
            AgentKind::River => "river",
        })
    }
}

/// Road hierarchy, from footpaths up to carriage roads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoadCategory {
    Stepway,
    Path,
    SmallRoad,
    Road,
}

/// Attributes exposed to target filters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentAttributes {
    pub road_category: Option<RoadCategory>,
}

/// A spatial agent: a geometry plus the attributes filters can inspect.
#[derive(Clone, Debug, PartialEq)]
pub struct Agent {
    pub kind: AgentKind,
    pub geometry: Geometry<f64>,
    pub attributes: AgentAttributes,
}

impl Agent {
    #[must_use]
    pub fn dwelling(footprint: Polygon<f64>) -> Self {
        Self {
            kind: AgentKind::Dwelling,
            geometry: Geometry::Polygon(footprint),
            attributes: AgentAttributes::default(),
        }
    }

    #[must_use]
    pub fn road(path: LineString<f64>, category: RoadCategory) -> Self {
        Self {
            kind: AgentKind::Road,
            geometry: Geometry::LineString(path),
            attributes: AgentAttributes {
                road_category: Some(category),
            },
        }
    }

    #[must_use]
    pub fn river(course: Geometry<f64>) -> Self {
        Self {
            kind: AgentKind::River,
            geometry: course,
            attributes: AgentAttributes::default(),
        }
    }
}

/// Arena of live agents keyed by [`AgentId`].
#[derive(Clone, Debug, Default)]
pub struct AgentBook {
    agents: SlotMap<AgentId, Agent>,
}

impl AgentBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, agent: Agent) -> AgentId {
        self.agents.insert(agent)
    }

    pub fn remove(&mut self, id: AgentId) -> Option<Agent> {
        self.agents.remove(id)
    }

    #[must_use]
    pub fn get(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AgentId, &Agent)> + '_ {
        self.agents.iter()
    }

    pub fn of_kind(&self, kind: AgentKind) -> impl Iterator<Item = (AgentId, &Agent)> + '_ {
        self.agents.iter().filter(move |(_, agent)| agent.kind == kind)
    }

    #[must_use]
    pub fn count_of(&self, kind: AgentKind) -> usize {
        self.of_kind(kind).count()
    }

    /// Geometries of every agent the selector accepts, cloned for indexing.
    #[must_use]
    pub fn geometries_matching(&self, selector: &TargetSelector) -> Vec<Geometry<f64>> {
        self.agents
            .values()
            .filter(|agent| selector.matches(agent))
            .map(|agent| agent.geometry.clone())
            .collect()
    }
}

/// Attribute predicate narrowing targets beyond their kind.
pub type AttributeFilter = Arc<dyn Fn(&AgentAttributes) -> bool + Send + Sync>;

/// Picks which agents an influence measures distance to.
#[derive(Clone)]
pub struct TargetSelector {
    kind: AgentKind,
    filter: Option<AttributeFilter>,
}

impl TargetSelector {
    /// Every agent of the given kind.
    #[must_use]
    pub fn of_kind(kind: AgentKind) -> Self {
        Self { kind, filter: None }
    }

    /// Agents of the given kind whose attributes pass `filter`.
    #[must_use]
    pub fn filtered(kind: AgentKind, filter: AttributeFilter) -> Self {
        Self {
            kind,
            filter: Some(filter),
        }
    }

    /// Roads whose category is one of `categories`.
    #[must_use]
    pub fn roads_among(categories: &[RoadCategory]) -> Self {
        let allowed = categories.to_vec();
        Self::filtered(
            AgentKind::Road,
            Arc::new(move |attributes| {
                attributes
                    .road_category
                    .is_some_and(|category| allowed.contains(&category))
            }),
        )
    }

    #[must_use]
    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    #[must_use]
    pub fn matches(&self, agent: &Agent) -> bool {
        agent.kind == self.kind
            && self
                .filter
                .as_ref()
                .is_none_or(|filter| filter(&agent.attributes))
    }
}

impl fmt::Debug for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetSelector")
            .field("kind", &self.kind)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Probes and the border
// ---------------------------------------------------------------------------

/// A candidate footprint, kept centred on the local origin until placed.
#[derive(Clone, Debug, PartialEq)]
pub struct Probe {
    shape: MultiPolygon<f64>,
}

impl Probe {
    #[must_use]
    pub fn new(shape: MultiPolygon<f64>) -> Self {
        Self { shape }
    }

    #[must_use]
    pub fn from_polygon(footprint: Polygon<f64>) -> Self {
        Self::new(MultiPolygon(vec![footprint]))
    }

    /// Axis-aligned square footprint with the given edge length.
    #[must_use]
    pub fn square(edge: f64) -> Self {
        let half = edge / 2.0;
        Self::from_polygon(
            Rect::new(coord! { x: -half, y: -half }, coord! { x: half, y: half }).to_polygon(),
        )
    }

    /// Rectangle of the given area, with `ratio` height over width, rotated
    /// by `angle_degrees` around its centre.
    #[must_use]
    pub fn rectangle(area: f64, ratio: f64, angle_degrees: f64) -> Self {
        let height = (area * ratio).sqrt();
        let width = area / height;
        let footprint = Rect::new(
            coord! { x: -width / 2.0, y: -height / 2.0 },
            coord! { x: width / 2.0, y: height / 2.0 },
        )
        .to_polygon()
        .rotate_around_centroid(angle_degrees);
        Self::from_polygon(footprint)
    }

    #[must_use]
    pub fn shape(&self) -> &MultiPolygon<f64> {
        &self.shape
    }

    /// The footprint translated so its local origin lands on `position`.
    #[must_use]
    pub fn placed_at(&self, position: Point<f64>) -> MultiPolygon<f64> {
        self.shape.translate(position.x(), position.y())
    }
}

/// The buildable boundary of the world.
#[derive(Clone, Debug)]
pub struct Border {
    shape: Polygon<f64>,
    bounds: Rect<f64>,
}

impl Border {
    pub fn new(shape: Polygon<f64>) -> Result<Self, WorldError> {
        if shape.exterior().0.len() < 4 {
            return Err(WorldError::InvalidConfig(
                "border ring needs at least three points",
            ));
        }
        if shape.unsigned_area() <= 0.0 {
            return Err(WorldError::InvalidConfig("border encloses no area"));
        }
        let bounds = shape
            .bounding_rect()
            .ok_or(WorldError::InvalidConfig("border has no extent"))?;
        Ok(Self { shape, bounds })
    }

    #[must_use]
    pub fn shape(&self) -> &Polygon<f64> {
        &self.shape
    }

    #[must_use]
    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    #[must_use]
    pub fn contains_point(&self, position: Point<f64>) -> bool {
        self.shape.contains(&position)
    }

    /// True when every part of the footprint lies inside the border.
    #[must_use]
    pub fn contains_footprint(&self, footprint: &MultiPolygon<f64>) -> bool {
        footprint.0.iter().all(|part| self.shape.contains(part))
    }

    /// Uniform random point inside the border, by rejection sampling from
    /// the bounding box.
    pub fn random_point(&self, rng: &mut SmallRng) -> Point<f64> {
        let min = self.bounds.min();
        let max = self.bounds.max();
        loop {
            let candidate = Point::new(
                rng.random_range(min.x..max.x),
                rng.random_range(min.y..max.y),
            );
            if self.shape.contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Bounding-box diagonal, an upper bound on any distance inside the
    /// border.
    #[must_use]
    pub fn greatest_distance(&self) -> f64 {
        let min = self.bounds.min();
        let max = self.bounds.max();
        (max.x - min.x).hypot(max.y - min.y)
    }
}

// ---------------------------------------------------------------------------
// Terrain rasters
// ---------------------------------------------------------------------------

/// A regular grid of samples anchored at its north-west corner, row-major
/// from the north-west like the usual geo-raster layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Raster {
    west: f64,
    north: f64,
    pixel_size: f64,
    width: usize,
    height: usize,
    no_data: Option<f64>,
    cells: Vec<f64>,
}

impl Raster {
    pub fn from_cells(
        west: f64,
        north: f64,
        pixel_size: f64,
        width: usize,
        height: usize,
        no_data: Option<f64>,
        cells: Vec<f64>,
    ) -> Result<Self, WorldError> {
        if !(pixel_size > 0.0) {
            return Err(WorldError::InvalidConfig("raster pixel size must be positive"));
        }
        if width == 0 || height == 0 {
            return Err(WorldError::InvalidConfig("raster dimensions must be non-zero"));
        }
        if cells.len() != width * height {
            return Err(WorldError::InvalidConfig(
                "raster cell count does not match its dimensions",
            ));
        }
        Ok(Self {
            west,
            north,
            pixel_size,
            width,
            height,
            no_data,
            cells,
        })
    }

    /// Inclined plane `base + x_gradient * x + y_gradient * y`, sampled at
    /// cell centres. Handy for tests and demo scenarios.
    pub fn plane(
        west: f64,
        north: f64,
        pixel_size: f64,
        width: usize,
        height: usize,
        base: f64,
        x_gradient: f64,
        y_gradient: f64,
    ) -> Result<Self, WorldError> {
        if !(pixel_size > 0.0) {
            return Err(WorldError::InvalidConfig("raster pixel size must be positive"));
        }
        let mut cells = Vec::with_capacity(width * height);
        for row in 0..height {
            let y = north - (row as f64 + 0.5) * pixel_size;
            for col in 0..width {
                let x = west + (col as f64 + 0.5) * pixel_size;
                cells.push(base + x_gradient * x + y_gradient * y);
            }
        }
        Self::from_cells(west, north, pixel_size, width, height, None, cells)
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    #[must_use]
    pub fn west(&self) -> f64 {
        self.west
    }

    #[must_use]
    pub fn north(&self) -> f64 {
        self.north
    }

    #[must_use]
    pub fn east(&self) -> f64 {
        self.west + self.width as f64 * self.pixel_size
    }

    #[must_use]
    pub fn south(&self) -> f64 {
        self.north - self.height as f64 * self.pixel_size
    }

    /// Sample under a point. `None` off the raster, on a no-data cell, or
    /// on a NaN cell.
    #[must_use]
    pub fn value_at(&self, position: Point<f64>) -> Option<f64> {
        let (x, y) = (position.x(), position.y());
        if x < self.west || x > self.east() || y > self.north || y < self.south() {
            return None;
        }
        let col = (((x - self.west) / self.pixel_size).floor() as usize).min(self.width - 1);
        let row = (((self.north - y) / self.pixel_size).floor() as usize).min(self.height - 1);
        let value = self.cells[row * self.width + col];
        if value.is_nan() || self.no_data.is_some_and(|no_data| value == no_data) {
            return None;
        }
        Some(value)
    }

    /// Steepest ground angle under a footprint, in radians.
    ///
    /// Each part is sampled at its exterior vertices and centroid; the angle
    /// is measured between the lowest and highest samples. A part whose
    /// extremes coincide is flat. `None` as soon as any sample is undefined,
    /// so callers can veto footprints that leave the mapped terrain.
    /// Multi-part footprints report their steepest part.
    #[must_use]
    pub fn slope(&self, footprint: &MultiPolygon<f64>) -> Option<f64> {
        let mut steepest: Option<f64> = None;
        for part in &footprint.0 {
            let slope = self.part_slope(part)?;
            if steepest.is_none_or(|current| slope > current) {
                steepest = Some(slope);
            }
        }
        steepest
    }

    /// True when the footprint sits entirely on ground no steeper than
    /// `max_slope`.
    #[must_use]
    pub fn slope_within(&self, footprint: &MultiPolygon<f64>, max_slope: f64) -> bool {
        self.slope(footprint).is_some_and(|slope| slope <= max_slope)
    }

    fn part_slope(&self, part: &Polygon<f64>) -> Option<f64> {
        let centroid = part.centroid()?;
        let ring = &part.exterior().0;
        let open_ring = &ring[..ring.len().saturating_sub(1)];
        let mut low: Option<(Point<f64>, f64)> = None;
        let mut high: Option<(Point<f64>, f64)> = None;
        for sample in open_ring
            .iter()
            .map(|c| Point::from(*c))
            .chain(std::iter::once(centroid))
        {
            let value = self.value_at(sample)?;
            if low.is_none_or(|(_, lowest)| value < lowest) {
                low = Some((sample, value));
            }
            if high.is_none_or(|(_, highest)| value > highest) {
                high = Some((sample, value));
            }
        }
        let (low_point, low_value) = low?;
        let (high_point, high_value) = high?;
        let run = low_point.euclidean_distance(&high_point);
        if run == 0.0 {
            return Some(0.0);
        }
        Some(((high_value - low_value) / run).atan())
    }
}

// ---------------------------------------------------------------------------
// Influences
// ---------------------------------------------------------------------------

/// One weighted contribution to an influence field.
///
/// Implementations score the probe placed at a position with a raw value in
/// `[-1, 1]`; a value at or below [`VETO_SCORE`] vetoes the site outright.
/// [`reset`](Influence::reset) marks any cached target data stale, and
/// implementations rebuild lazily on the next evaluation, so one step's
/// worth of queries shares a single snapshot of the world geometry.
pub trait Influence: fmt::Debug + Send {
    /// Name used in logs.
    fn label(&self) -> &str;

    /// Weight applied when the field sums contributions.
    fn weight(&self) -> f64;

    /// Raw score for the probe placed at `position`.
    fn evaluate(&mut self, registry: &AgentBook, probe: &Probe, position: Point<f64>) -> f64;

    /// Invalidates cached target data after world geometry changed.
    fn reset(&mut self);
}

/// Distance-driven influence: a response curve applied to the distance from
/// the placed footprint to the nearest selected agent.
///
/// The target index is tagged with the epoch it was built in and rebuilds
/// lazily after each [`reset`](Influence::reset). While the selector matches
/// no agents the influence vetoes every site, which keeps searches from
/// wandering into terrain the scenario gave them no reason to rank.
pub struct DistanceInfluence {
    label: String,
    selector: TargetSelector,
    function: InfluenceFunction,
    weight: f64,
    index: Box<dyn ProximityIndex + Send>,
    epoch: u64,
    built_epoch: Option<u64>,
    indexed_targets: usize,
}

impl DistanceInfluence {
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        selector: TargetSelector,
        function: InfluenceFunction,
        weight: f64,
    ) -> Self {
        Self::with_index(label, selector, function, weight, Box::new(RTreeIndex::new()))
    }

    /// As [`new`](Self::new) with a caller-chosen index backend.
    #[must_use]
    pub fn with_index(
        label: impl Into<String>,
        selector: TargetSelector,
        function: InfluenceFunction,
        weight: f64,
        index: Box<dyn ProximityIndex + Send>,
    ) -> Self {
        Self {
            label: label.into(),
            selector,
            function,
            weight,
            index,
            epoch: 0,
            built_epoch: None,
            indexed_targets: 0,
        }
    }

    /// Targets captured by the last index rebuild.
    #[must_use]
    pub fn indexed_targets(&self) -> usize {
        self.indexed_targets
    }

    fn ensure_index(&mut self, registry: &AgentBook) {
        if self.built_epoch == Some(self.epoch) {
            return;
        }
        let targets = registry.geometries_matching(&self.selector);
        self.index.rebuild(&targets);
        self.indexed_targets = self.index.len();
        self.built_epoch = Some(self.epoch);
        if self.indexed_targets == 0 {
            warn!(
                influence = %self.label,
                "no targets matched; vetoing every site this epoch"
            );
        } else {
            debug!(
                influence = %self.label,
                targets = self.indexed_targets,
                "rebuilt target index"
            );
        }
    }
}

impl Influence for DistanceInfluence {
    fn label(&self) -> &str {
        &self.label
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, registry: &AgentBook, probe: &Probe, position: Point<f64>) -> f64 {
        self.ensure_index(registry);
        match self.index.nearest_distance(&probe.placed_at(position)) {
            Some(distance) => self.function.value(distance),
            None => VETO_SCORE,
        }
    }

    fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }
}

impl fmt::Debug for DistanceInfluence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistanceInfluence")
            .field("label", &self.label)
            .field("selector", &self.selector)
            .field("function", &self.function)
            .field("weight", &self.weight)
            .field("indexed_targets", &self.indexed_targets)
            .finish()
    }
}

/// Terrain-driven influence: a response curve applied to the steepest slope
/// under the placed footprint.
///
/// Footprints that leave the raster or touch no-data cells are vetoed, so
/// searches cannot settle on unmapped ground.
#[derive(Debug)]
pub struct SlopeInfluence {
    label: String,
    raster: Arc<Raster>,
    function: InfluenceFunction,
    weight: f64,
}

impl SlopeInfluence {
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        raster: Arc<Raster>,
        function: InfluenceFunction,
        weight: f64,
    ) -> Self {
        Self {
            label: label.into(),
            raster,
            function,
            weight,
        }
    }
}

impl Influence for SlopeInfluence {
    fn label(&self) -> &str {
        &self.label
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, _registry: &AgentBook, probe: &Probe, position: Point<f64>) -> f64 {
        match self.raster.slope(&probe.placed_at(position)) {
            Some(slope) => self.function.value(slope),
            None => VETO_SCORE,
        }
    }

    fn reset(&mut self) {}
}

// ---------------------------------------------------------------------------
// Influence fields and site search
// ---------------------------------------------------------------------------

/// A position paired with its aggregate score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchState {
    pub position: Point<f64>,
    pub score: f64,
}

/// Tuning for one hill-climbing run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchParams {
    /// Opening neighbour-ring radius.
    pub step: f64,
    /// Ring shrink factor applied after each accepted move.
    pub epsilon: f64,
    /// Stop once the ring radius drops below this.
    pub step_tolerance: f64,
    /// Stop once the best move changes the score by less than this.
    pub convergence: f64,
    /// Random start candidates sampled before giving up.
    pub start_tries: u32,
}

impl SearchParams {
    /// Wide single-shot search: a large opening ring cooled slowly.
    #[must_use]
    pub fn single_shot() -> Self {
        Self {
            step: 10.0,
            epsilon: 0.9,
            step_tolerance: 0.1,
            convergence: 1e-3,
            start_tries: DEFAULT_START_TRIES,
        }
    }

    /// Narrow per-restart search used by the batched strategy.
    #[must_use]
    pub fn restart() -> Self {
        Self {
            step: 1.0,
            epsilon: 0.95,
            ..Self::single_shot()
        }
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::single_shot()
    }
}

/// The eight compass points at `radius` around `center`.
fn ring_neighbours(center: Point<f64>, radius: f64) -> impl Iterator<Item = Point<f64>> {
    (0..RING_NEIGHBOURS).map(move |i| {
        let angle = f64::from(i) * TAU / f64::from(RING_NEIGHBOURS);
        Point::new(
            round15(center.x() + radius * angle.cos()),
            round15(center.y() + radius * angle.sin()),
        )
    })
}

/// A named, weighted bundle of influences: both the scoring surface and the
/// thing site searches climb.
#[derive(Debug, Default)]
pub struct InfluenceField {
    influences: Vec<Box<dyn Influence>>,
}

impl InfluenceField {
    #[must_use]
    pub fn new(influences: Vec<Box<dyn Influence>>) -> Self {
        Self { influences }
    }

    pub fn push(&mut self, influence: Box<dyn Influence>) {
        self.influences.push(influence);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.influences.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.influences.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.influences.iter().map(|influence| influence.label())
    }

    /// Sum of influence weights. Scenarios usually keep this at 1 so scores
    /// stay in `[-1, 1]`, but nothing enforces it.
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.influences.iter().map(|influence| influence.weight()).sum()
    }

    /// Aggregate score for the probe placed at `position`.
    ///
    /// Influences are polled in registration order; the first raw value at
    /// or below [`VETO_SCORE`] short-circuits the whole aggregate to the
    /// veto score. An empty field scores zero everywhere.
    pub fn score(&mut self, registry: &AgentBook, probe: &Probe, position: Point<f64>) -> f64 {
        let mut total = 0.0;
        for influence in &mut self.influences {
            let raw = influence.evaluate(registry, probe, position);
            if raw <= VETO_SCORE {
                return VETO_SCORE;
            }
            total += raw * influence.weight();
        }
        total
    }

    /// Marks every influence's cached target data stale.
    pub fn reset(&mut self) {
        for influence in &mut self.influences {
            influence.reset();
        }
    }

    /// Single hill-climbing run from one random valid start.
    pub fn search_site(
        &mut self,
        registry: &AgentBook,
        border: &Border,
        probe: &Probe,
        rng: &mut SmallRng,
    ) -> Result<SearchState, SearchError> {
        self.search_site_with(registry, border, probe, rng, SearchParams::single_shot())
    }

    /// Single hill-climbing run with explicit tuning.
    pub fn search_site_with(
        &mut self,
        registry: &AgentBook,
        border: &Border,
        probe: &Probe,
        rng: &mut SmallRng,
        params: SearchParams,
    ) -> Result<SearchState, SearchError> {
        let start = self.random_valid_start(registry, border, probe, rng, params.start_tries)?;
        Ok(self.ascend(registry, probe, start, params))
    }

    /// Best result across several independent restarts.
    ///
    /// Restarts that find no valid start are skipped; the search only fails
    /// when every restart does.
    pub fn search_site_batched(
        &mut self,
        registry: &AgentBook,
        border: &Border,
        probe: &Probe,
        rng: &mut SmallRng,
        restarts: u32,
    ) -> Result<SearchState, SearchError> {
        self.search_site_batched_with(registry, border, probe, rng, restarts, SearchParams::restart())
    }

    /// Best-of-`restarts` search with explicit tuning.
    pub fn search_site_batched_with(
        &mut self,
        registry: &AgentBook,
        border: &Border,
        probe: &Probe,
        rng: &mut SmallRng,
        restarts: u32,
        params: SearchParams,
    ) -> Result<SearchState, SearchError> {
        let runs = restarts.max(1);
        let mut best: Option<SearchState> = None;
        let mut failed = 0u32;
        for _ in 0..runs {
            match self.search_site_with(registry, border, probe, rng, params) {
                Ok(found) => {
                    if best.is_none_or(|current| found.score > current.score) {
                        best = Some(found);
                    }
                }
                Err(SearchError::NoValidStartPoint { .. }) => failed += 1,
            }
        }
        if failed > 0 {
            debug!(failed, runs, "restarts without a valid start point");
        }
        best.ok_or(SearchError::NoValidStartPoint {
            attempts: runs * params.start_tries,
        })
    }

    fn random_valid_start(
        &mut self,
        registry: &AgentBook,
        border: &Border,
        probe: &Probe,
        rng: &mut SmallRng,
        tries: u32,
    ) -> Result<SearchState, SearchError> {
        for _ in 0..tries {
            let position = border.random_point(rng);
            let score = self.score(registry, probe, position);
            if score > VETO_SCORE {
                return Ok(SearchState { position, score });
            }
        }
        Err(SearchError::NoValidStartPoint { attempts: tries })
    }

    /// Climbs from `start`, moving to the steepest-rising ring neighbour and
    /// shrinking the ring until the radius undercuts the tolerance, the best
    /// neighbour is downhill, or the improvement falls under the convergence
    /// threshold.
    fn ascend(
        &mut self,
        registry: &AgentBook,
        probe: &Probe,
        start: SearchState,
        params: SearchParams,
    ) -> SearchState {
        let mut current = start;
        let mut step = params.step;
        loop {
            let mut best_neighbour = current;
            let mut steepest_rise = f64::NEG_INFINITY;
            for position in ring_neighbours(current.position, step) {
                let score = self.score(registry, probe, position);
                let rise = (score - current.score) / step;
                if rise > steepest_rise {
                    steepest_rise = rise;
                    best_neighbour = SearchState { position, score };
                }
            }
            if step < params.step_tolerance || best_neighbour.score < current.score {
                return current;
            }
            if (current.score - best_neighbour.score).abs() < params.convergence {
                return best_neighbour;
            }
            current = best_neighbour;
            step *= params.epsilon;
        }
    }
}

// ---------------------------------------------------------------------------
// Rasterised field preview
// ---------------------------------------------------------------------------

/// An influence field sampled on a regular grid, row-major from the
/// north-west.
#[derive(Clone, Debug, PartialEq)]
pub struct InfluenceMap {
    west: f64,
    north: f64,
    pixel_size: f64,
    width: usize,
    height: usize,
    values: Vec<f64>,
}

impl InfluenceMap {
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    #[must_use]
    pub fn west(&self) -> f64 {
        self.west
    }

    #[must_use]
    pub fn north(&self) -> f64 {
        self.north
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, col: usize, row: usize) -> Option<f64> {
        (col < self.width && row < self.height).then(|| self.values[row * self.width + col])
    }

    /// Greyscale bytes mapping a score of -1 to 0 and 1 to 255.
    #[must_use]
    pub fn to_gray(&self) -> Vec<u8> {
        self.values
            .iter()
            .map(|value| (((value + 1.0) / 2.0).clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Curve families scenario files can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveKind {
    AttractionRepulsion,
    OpenDistance,
    CloseDistance,
    Balance,
}

/// Declarative form of an influence curve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub curve: CurveKind,
    pub l_min: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l_zero: Option<f64>,
    pub l_max: f64,
}

impl FunctionSpec {
    pub fn build(&self) -> Result<InfluenceFunction, InfluenceError> {
        match self.curve {
            CurveKind::AttractionRepulsion => {
                let l_zero = self.l_zero.ok_or(InfluenceError::MissingBreakpoint {
                    curve: "attraction_repulsion",
                })?;
                InfluenceFunction::attraction_repulsion(self.l_min, l_zero, self.l_max)
            }
            CurveKind::OpenDistance => {
                if self.l_zero.is_some() {
                    return Err(InfluenceError::ExtraBreakpoint {
                        curve: "open_distance",
                    });
                }
                InfluenceFunction::open_distance(self.l_min, self.l_max)
            }
            CurveKind::CloseDistance => {
                if self.l_zero.is_some() {
                    return Err(InfluenceError::ExtraBreakpoint {
                        curve: "close_distance",
                    });
                }
                InfluenceFunction::close_distance(self.l_min, self.l_max)
            }
            CurveKind::Balance => {
                let l_zero = self
                    .l_zero
                    .ok_or(InfluenceError::MissingBreakpoint { curve: "balance" })?;
                InfluenceFunction::balance(self.l_min, l_zero, self.l_max)
            }
        }
    }
}

/// Declarative form of one influence in a field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluatorSpec {
    /// Distance to the nearest agent of `target`, optionally narrowed to
    /// certain road categories.
    Distance {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        target: AgentKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        road_categories: Option<Vec<RoadCategory>>,
        function: FunctionSpec,
        weight: f64,
    },
    /// Terrain slope sampled from a named raster.
    Slope {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        raster: String,
        function: FunctionSpec,
        weight: f64,
    },
}

impl EvaluatorSpec {
    #[must_use]
    pub fn weight(&self) -> f64 {
        match self {
            EvaluatorSpec::Distance { weight, .. } | EvaluatorSpec::Slope { weight, .. } => *weight,
        }
    }

    #[must_use]
    pub fn function(&self) -> &FunctionSpec {
        match self {
            EvaluatorSpec::Distance { function, .. } | EvaluatorSpec::Slope { function, .. } => {
                function
            }
        }
    }

    fn build(&self, rasters: &HashMap<String, Arc<Raster>>) -> Result<Box<dyn Influence>, WorldError> {
        match self {
            EvaluatorSpec::Distance {
                label,
                target,
                road_categories,
                function,
                weight,
            } => {
                let selector = match road_categories {
                    Some(categories) => {
                        if *target != AgentKind::Road {
                            return Err(WorldError::InvalidConfig(
                                "road categories only apply to road targets",
                            ));
                        }
                        TargetSelector::roads_among(categories)
                    }
                    None => TargetSelector::of_kind(*target),
                };
                let label = label
                    .clone()
                    .unwrap_or_else(|| format!("near_{target}"));
                Ok(Box::new(DistanceInfluence::new(
                    label,
                    selector,
                    function.build()?,
                    *weight,
                )))
            }
            EvaluatorSpec::Slope {
                label,
                raster,
                function,
                weight,
            } => {
                let surface = rasters
                    .get(raster)
                    .ok_or_else(|| WorldError::UnknownRaster(raster.clone()))?;
                let label = label.clone().unwrap_or_else(|| format!("slope_{raster}"));
                Ok(Box::new(SlopeInfluence::new(
                    label,
                    Arc::clone(surface),
                    function.build()?,
                    *weight,
                )))
            }
        }
    }
}

/// How a raster's cells are produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SurfaceSpec {
    /// Explicit row-major cell values, north-west first.
    Cells { values: Vec<f64> },
    /// Inclined plane evaluated at cell centres.
    Plane {
        base: f64,
        x_gradient: f64,
        y_gradient: f64,
    },
}

/// Declarative raster description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RasterSpec {
    pub name: String,
    pub west: f64,
    pub north: f64,
    pub pixel_size: f64,
    pub width: usize,
    pub height: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_data: Option<f64>,
    pub surface: SurfaceSpec,
}

impl RasterSpec {
    pub fn build(&self) -> Result<Raster, WorldError> {
        match &self.surface {
            SurfaceSpec::Cells { values } => Raster::from_cells(
                self.west,
                self.north,
                self.pixel_size,
                self.width,
                self.height,
                self.no_data,
                values.clone(),
            ),
            SurfaceSpec::Plane {
                base,
                x_gradient,
                y_gradient,
            } => Raster::plane(
                self.west,
                self.north,
                self.pixel_size,
                self.width,
                self.height,
                *base,
                *x_gradient,
                *y_gradient,
            ),
        }
    }
}

/// Declarative seed agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub kind: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<RoadCategory>,
    /// Closed polygon ring, for dwellings and polygonal rivers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring: Option<Vec<[f64; 2]>>,
    /// Open polyline, for roads and river courses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<[f64; 2]>>,
}

fn ring_polygon(ring: &[[f64; 2]]) -> Polygon<f64> {
    Polygon::new(
        LineString::from(ring.iter().map(|[x, y]| (*x, *y)).collect::<Vec<_>>()),
        Vec::new(),
    )
}

fn path_line(path: &[[f64; 2]]) -> LineString<f64> {
    LineString::from(path.iter().map(|[x, y]| (*x, *y)).collect::<Vec<_>>())
}

impl AgentSpec {
    pub fn build(&self) -> Result<Agent, WorldError> {
        if self.kind != AgentKind::Road && self.category.is_some() {
            return Err(WorldError::InvalidConfig(
                "only road agents take a category",
            ));
        }
        match self.kind {
            AgentKind::Dwelling => {
                let ring = self
                    .ring
                    .as_ref()
                    .ok_or(WorldError::InvalidConfig("dwelling agents need a ring"))?;
                if ring.len() < 3 {
                    return Err(WorldError::InvalidConfig(
                        "agent rings need at least three points",
                    ));
                }
                Ok(Agent::dwelling(ring_polygon(ring)))
            }
            AgentKind::Road => {
                let path = self
                    .path
                    .as_ref()
                    .ok_or(WorldError::InvalidConfig("road agents need a path"))?;
                if path.len() < 2 {
                    return Err(WorldError::InvalidConfig(
                        "agent paths need at least two points",
                    ));
                }
                let category = self
                    .category
                    .ok_or(WorldError::InvalidConfig("road agents need a category"))?;
                Ok(Agent::road(path_line(path), category))
            }
            AgentKind::River => match (&self.ring, &self.path) {
                (Some(ring), None) if ring.len() >= 3 => {
                    Ok(Agent::river(Geometry::Polygon(ring_polygon(ring))))
                }
                (None, Some(path)) if path.len() >= 2 => {
                    Ok(Agent::river(Geometry::LineString(path_line(path))))
                }
                _ => Err(WorldError::InvalidConfig(
                    "river agents need either a ring or a path",
                )),
            },
        }
    }
}

/// Dwelling growth attempted each world step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthSettings {
    /// New dwellings attempted per step. Zero disables growth.
    pub dwellings_per_step: u32,
    /// Influence field consulted when siting new dwellings.
    pub influence: String,
    /// Footprint area range sampled per dwelling.
    pub area_min: f64,
    pub area_max: f64,
}

impl Default for GrowthSettings {
    fn default() -> Self {
        Self {
            dwellings_per_step: 0,
            influence: "house_building".to_owned(),
            area_min: 40.0,
            area_max: 120.0,
        }
    }
}

/// Site-search knobs exposed to scenarios.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Hill-climbing restarts per site search.
    pub restarts: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self { restarts: 2 }
    }
}

/// Tunable parameters and scene description for a sprawl world.
///
/// The default is a small empty square world; scenario files override most
/// of this.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SprawlConfig {
    /// Closed ring of the buildable border.
    pub border: Vec<[f64; 2]>,
    /// Deterministic seed; `None` draws one from the OS.
    pub rng_seed: Option<u64>,
    /// Step summaries retained in the world history.
    pub history_capacity: usize,
    pub growth: GrowthSettings,
    pub search: SearchSettings,
    /// Named rasters available to slope influences.
    pub rasters: Vec<RasterSpec>,
    /// Agents present before the first step.
    pub agents: Vec<AgentSpec>,
    /// Named influence fields, each built in declaration order.
    pub influences: BTreeMap<String, Vec<EvaluatorSpec>>,
}

impl Default for SprawlConfig {
    fn default() -> Self {
        Self {
            border: vec![[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]],
            rng_seed: None,
            history_capacity: 256,
            growth: GrowthSettings::default(),
            search: SearchSettings::default(),
            rasters: Vec::new(),
            agents: Vec::new(),
            influences: BTreeMap::new(),
        }
    }
}

impl SprawlConfig {
    /// Validates everything checkable without building a world.
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.border.len() < 3 {
            return Err(WorldError::InvalidConfig(
                "border ring needs at least three points",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig("history capacity must be non-zero"));
        }
        if !(self.growth.area_min > 0.0) {
            return Err(WorldError::InvalidConfig("growth area_min must be positive"));
        }
        if self.growth.area_max < self.growth.area_min {
            return Err(WorldError::InvalidConfig("growth area range is inverted"));
        }
        if self.search.restarts == 0 {
            return Err(WorldError::InvalidConfig("search needs at least one restart"));
        }
        if self.growth.dwellings_per_step > 0 && !self.influences.contains_key(&self.growth.influence)
        {
            return Err(WorldError::InvalidConfig(
                "growth names an influence set that is not defined",
            ));
        }
        let mut raster_names = Vec::with_capacity(self.rasters.len());
        for spec in &self.rasters {
            if !(spec.pixel_size > 0.0) {
                return Err(WorldError::InvalidConfig("raster pixel size must be positive"));
            }
            if spec.width == 0 || spec.height == 0 {
                return Err(WorldError::InvalidConfig("raster dimensions must be non-zero"));
            }
            if let SurfaceSpec::Cells { values } = &spec.surface {
                if values.len() != spec.width * spec.height {
                    return Err(WorldError::InvalidConfig(
                        "raster cell count does not match its dimensions",
                    ));
                }
            }
            if raster_names.contains(&spec.name.as_str()) {
                return Err(WorldError::InvalidConfig("raster names must be unique"));
            }
            raster_names.push(spec.name.as_str());
        }
        for (name, specs) in &self.influences {
            if name.is_empty() {
                return Err(WorldError::InvalidConfig(
                    "influence set names must be non-empty",
                ));
            }
            if specs.is_empty() {
                return Err(WorldError::InvalidConfig(
                    "influence sets must hold at least one influence",
                ));
            }
            for spec in specs {
                if !(0.0..=1.0).contains(&spec.weight()) {
                    return Err(WorldError::InvalidConfig(
                        "influence weights must lie in [0, 1]",
                    ));
                }
                spec.function().build()?;
                if let EvaluatorSpec::Distance {
                    target,
                    road_categories: Some(_),
                    ..
                } = spec
                {
                    if *target != AgentKind::Road {
                        return Err(WorldError::InvalidConfig(
                            "road categories only apply to road targets",
                        ));
                    }
                }
            }
        }
        for agent in &self.agents {
            agent.build()?;
        }
        Ok(())
    }

    /// RNG seeded from config, falling back to OS entropy.
    #[must_use]
    pub fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }

    fn border_polygon(&self) -> Polygon<f64> {
        ring_polygon(&self.border)
    }
}

// ---------------------------------------------------------------------------
// The world
// ---------------------------------------------------------------------------

/// What one simulation step did.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepSummary {
    pub tick: Tick,
    /// Dwellings successfully placed this step.
    pub placed: u32,
    /// Placement attempts that failed.
    pub failed: u32,
    /// Dwellings alive after the step.
    pub dwellings: usize,
    /// Mean aggregate score of the sites chosen this step.
    pub mean_site_score: Option<f64>,
}

/// The settlement world: border, terrain, agents, influence fields, and the
/// step loop that grows the settlement.
#[derive(Debug)]
pub struct World {
    config: SprawlConfig,
    tick: Tick,
    rng: SmallRng,
    border: Border,
    registry: AgentBook,
    rasters: HashMap<String, Arc<Raster>>,
    influences: HashMap<String, InfluenceField>,
    history: VecDeque<StepSummary>,
}

impl World {
    /// Builds a world from config, failing fast on anything invalid.
    pub fn new(config: SprawlConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let border = Border::new(config.border_polygon())?;
        let mut rasters = HashMap::new();
        for spec in &config.rasters {
            rasters.insert(spec.name.clone(), Arc::new(spec.build()?));
        }
        let mut registry = AgentBook::new();
        for spec in &config.agents {
            registry.insert(spec.build()?);
        }
        let mut influences = HashMap::new();
        for (name, specs) in &config.influences {
            let mut field = InfluenceField::new(Vec::with_capacity(specs.len()));
            for spec in specs {
                field.push(spec.build(&rasters)?);
            }
            influences.insert(name.clone(), field);
        }
        let history = VecDeque::with_capacity(config.history_capacity);
        info!(
            agents = registry.len(),
            rasters = rasters.len(),
            influence_sets = influences.len(),
            "world ready"
        );
        Ok(Self {
            config,
            tick: Tick::default(),
            rng,
            border,
            registry,
            rasters,
            influences,
            history,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SprawlConfig {
        &self.config
    }

    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn border(&self) -> &Border {
        &self.border
    }

    #[must_use]
    pub fn registry(&self) -> &AgentBook {
        &self.registry
    }

    #[must_use]
    pub fn raster(&self, name: &str) -> Option<&Arc<Raster>> {
        self.rasters.get(name)
    }

    #[must_use]
    pub fn influence_mut(&mut self, name: &str) -> Option<&mut InfluenceField> {
        self.influences.get_mut(name)
    }

    pub fn influence_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.influences.keys().map(String::as_str)
    }

    pub fn history(&self) -> impl Iterator<Item = &StepSummary> + '_ {
        self.history.iter()
    }

    #[must_use]
    pub fn dwelling_count(&self) -> usize {
        self.registry.count_of(AgentKind::Dwelling)
    }

    /// Registers (or replaces) a named influence field.
    pub fn set_influence(&mut self, name: impl Into<String>, field: InfluenceField) {
        self.influences.insert(name.into(), field);
    }

    pub fn remove_influence(&mut self, name: &str) -> Option<InfluenceField> {
        self.influences.remove(name)
    }

    pub fn add_agent(&mut self, agent: Agent) -> AgentId {
        self.registry.insert(agent)
    }

    pub fn remove_agent(&mut self, id: AgentId) -> Option<Agent> {
        self.registry.remove(id)
    }

    /// Marks every influence field's cached indexes stale. Call after
    /// mutating world geometry outside [`step`](Self::step).
    pub fn reset_influences(&mut self) {
        for field in self.influences.values_mut() {
            field.reset();
        }
    }

    /// Aggregate score of `probe` placed at `position` under a named field.
    pub fn score(
        &mut self,
        influence: &str,
        probe: &Probe,
        position: Point<f64>,
    ) -> Result<f64, WorldError> {
        let field = self
            .influences
            .get_mut(influence)
            .ok_or_else(|| WorldError::UnknownInfluence(influence.to_owned()))?;
        Ok(field.score(&self.registry, probe, position))
    }

    /// Single-shot site search under a named field.
    pub fn find_site(&mut self, influence: &str, probe: &Probe) -> Result<Point<f64>, WorldError> {
        let field = self
            .influences
            .get_mut(influence)
            .ok_or_else(|| WorldError::UnknownInfluence(influence.to_owned()))?;
        let found = field.search_site(&self.registry, &self.border, probe, &mut self.rng)?;
        Ok(found.position)
    }

    /// Best-of-`restarts` site search under a named field.
    pub fn find_site_batched(
        &mut self,
        influence: &str,
        probe: &Probe,
        restarts: u32,
    ) -> Result<Point<f64>, WorldError> {
        let field = self
            .influences
            .get_mut(influence)
            .ok_or_else(|| WorldError::UnknownInfluence(influence.to_owned()))?;
        let found =
            field.search_site_batched(&self.registry, &self.border, probe, &mut self.rng, restarts)?;
        Ok(found.position)
    }

    /// Places one dwelling of roughly `area` under the named field, inserts
    /// it, and refreshes influence caches so later placements see it.
    pub fn grow_dwelling(&mut self, influence: &str, area: f64) -> Result<AgentId, WorldError> {
        self.place_dwelling(influence, area).map(|(id, _)| id)
    }

    /// Generates a footprint, sites it, and drops it if it pokes out of the
    /// border; the footprint is regenerated with a fresh aspect ratio and
    /// rotation on every attempt. A search that finds no valid start aborts
    /// the build instead of retrying.
    fn place_dwelling(
        &mut self,
        influence: &str,
        area: f64,
    ) -> Result<(AgentId, f64), WorldError> {
        let restarts = self.config.search.restarts;
        let field = self
            .influences
            .get_mut(influence)
            .ok_or_else(|| WorldError::UnknownInfluence(influence.to_owned()))?;
        for _ in 0..DWELLING_BUILD_TRIES {
            let ratio = self.rng.random_range(DWELLING_RATIO_MIN..=DWELLING_RATIO_MAX);
            let angle = f64::from(self.rng.random_range(1..=360));
            let probe = Probe::rectangle(area, ratio, angle);
            let found =
                field.search_site_batched(&self.registry, &self.border, &probe, &mut self.rng, restarts)?;
            let placed = probe.placed_at(found.position);
            if !self.border.contains_footprint(&placed) {
                continue;
            }
            if let Some(footprint) = placed.0.into_iter().next() {
                debug!(influence, score = found.score, "placed dwelling");
                let id = self.registry.insert(Agent::dwelling(footprint));
                for field in self.influences.values_mut() {
                    field.reset();
                }
                return Ok((id, found.score));
            }
        }
        Err(WorldError::ImpossibleBuild {
            tries: DWELLING_BUILD_TRIES,
        })
    }

    /// Advances the world one step: run dwelling growth, refresh influence
    /// caches, advance the clock, and record a summary.
    pub fn step(&mut self) -> StepSummary {
        let goal = self.config.growth.dwellings_per_step;
        let influence = self.config.growth.influence.clone();
        let (area_min, area_max) = (self.config.growth.area_min, self.config.growth.area_max);
        let mut placed = 0u32;
        let mut failed = 0u32;
        let mut score_total = 0.0;
        for _ in 0..goal {
            let area = self.rng.random_range(area_min..=area_max);
            match self.place_dwelling(&influence, area) {
                Ok((_, score)) => {
                    placed += 1;
                    score_total += score;
                }
                Err(error) => {
                    failed += 1;
                    warn!(%error, tick = self.tick.0, "dwelling placement failed");
                }
            }
        }
        self.reset_influences();
        self.tick.0 += 1;
        let summary = StepSummary {
            tick: self.tick,
            placed,
            failed,
            dwellings: self.dwelling_count(),
            mean_site_score: (placed > 0).then(|| score_total / f64::from(placed)),
        };
        debug!(tick = summary.tick.0, placed, failed, "step complete");
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        summary
    }

    /// Samples a named field on a regular grid over the border's bounding
    /// box, scanning row-major from the north-west corner.
    ///
    /// Rendering is read-only apart from the usual lazy index builds, so it
    /// never perturbs subsequent scores or searches.
    pub fn render_influence_map(
        &mut self,
        influence: &str,
        probe: &Probe,
        pixel_size: f64,
    ) -> Result<InfluenceMap, WorldError> {
        if !(pixel_size > 0.0) {
            return Err(WorldError::InvalidConfig("render pixel size must be positive"));
        }
        let field = self
            .influences
            .get_mut(influence)
            .ok_or_else(|| WorldError::UnknownInfluence(influence.to_owned()))?;
        let bounds = self.border.bounds();
        let west = bounds.min().x;
        let north = bounds.max().y;
        let width = ((bounds.max().x - west) / pixel_size).floor() as usize;
        let height = ((north - bounds.min().y) / pixel_size).floor() as usize;
        info!(influence, width, height, "rendering influence map");
        let mut values = Vec::with_capacity(width * height);
        for row in 0..height {
            let y = north - row as f64 * pixel_size;
            for col in 0..width {
                let x = west + col as f64 * pixel_size;
                values.push(field.score(&self.registry, probe, Point::new(x, y)));
            }
            if row % 32 == 0 {
                debug!(row, height, "influence map progress");
            }
        }
        info!(influence, "influence map done");
        Ok(InfluenceMap {
            west,
            north,
            pixel_size,
            width,
            height,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }

    fn square_at(cx: f64, cy: f64, half: f64) -> Polygon<f64> {
        Rect::new(
            coord! { x: cx - half, y: cy - half },
            coord! { x: cx + half, y: cy + half },
        )
        .to_polygon()
    }

    fn road_across(y: f64, category: RoadCategory) -> Agent {
        Agent::road(
            LineString::from(vec![(-100.0, y), (300.0, y)]),
            category,
        )
    }

    /// Influence returning a fixed raw value, for aggregation tests.
    #[derive(Debug)]
    struct ConstInfluence {
        value: f64,
        weight: f64,
    }

    impl Influence for ConstInfluence {
        fn label(&self) -> &str {
            "const"
        }

        fn weight(&self) -> f64 {
            self.weight
        }

        fn evaluate(&mut self, _registry: &AgentBook, _probe: &Probe, _position: Point<f64>) -> f64 {
            self.value
        }

        fn reset(&mut self) {}
    }

    /// Smooth cone peaking at `center`, for climb tests.
    #[derive(Debug)]
    struct PeakInfluence {
        center: Point<f64>,
        scale: f64,
    }

    impl Influence for PeakInfluence {
        fn label(&self) -> &str {
            "peak"
        }

        fn weight(&self) -> f64 {
            1.0
        }

        fn evaluate(&mut self, _registry: &AgentBook, _probe: &Probe, position: Point<f64>) -> f64 {
            let distance = position.euclidean_distance(&self.center);
            (1.0 - distance / self.scale).max(-0.9)
        }

        fn reset(&mut self) {}
    }

    /// Vetoes the half-plane left of `threshold`, for restart tests.
    #[derive(Debug)]
    struct GateInfluence {
        threshold: f64,
    }

    impl Influence for GateInfluence {
        fn label(&self) -> &str {
            "gate"
        }

        fn weight(&self) -> f64 {
            1.0
        }

        fn evaluate(&mut self, _registry: &AgentBook, _probe: &Probe, position: Point<f64>) -> f64 {
            if position.x() < self.threshold {
                VETO_SCORE
            } else {
                0.2
            }
        }

        fn reset(&mut self) {}
    }

    fn scenario_config() -> SprawlConfig {
        let mut influences = BTreeMap::new();
        influences.insert(
            "house_building".to_owned(),
            vec![
                EvaluatorSpec::Distance {
                    label: Some("neighbours".to_owned()),
                    target: AgentKind::Dwelling,
                    road_categories: None,
                    function: FunctionSpec {
                        curve: CurveKind::AttractionRepulsion,
                        l_min: 3.0,
                        l_zero: Some(15.0),
                        l_max: 40.0,
                    },
                    weight: 0.5,
                },
                EvaluatorSpec::Distance {
                    label: Some("paths".to_owned()),
                    target: AgentKind::Road,
                    road_categories: Some(vec![RoadCategory::Path, RoadCategory::SmallRoad]),
                    function: FunctionSpec {
                        curve: CurveKind::OpenDistance,
                        l_min: 2.0,
                        l_zero: None,
                        l_max: 60.0,
                    },
                    weight: 0.25,
                },
                EvaluatorSpec::Slope {
                    label: Some("terrain".to_owned()),
                    raster: "topography".to_owned(),
                    function: FunctionSpec {
                        curve: CurveKind::OpenDistance,
                        l_min: 0.3,
                        l_zero: None,
                        l_max: 0.6,
                    },
                    weight: 0.25,
                },
            ],
        );
        SprawlConfig {
            border: vec![[0.0, 0.0], [200.0, 0.0], [200.0, 200.0], [0.0, 200.0]],
            rng_seed: Some(11),
            growth: GrowthSettings {
                dwellings_per_step: 2,
                influence: "house_building".to_owned(),
                area_min: 40.0,
                area_max: 90.0,
            },
            rasters: vec![RasterSpec {
                name: "topography".to_owned(),
                west: -20.0,
                north: 220.0,
                pixel_size: 1.0,
                width: 240,
                height: 240,
                no_data: None,
                surface: SurfaceSpec::Plane {
                    base: 100.0,
                    x_gradient: 0.02,
                    y_gradient: 0.0,
                },
            }],
            agents: vec![
                AgentSpec {
                    kind: AgentKind::Road,
                    category: Some(RoadCategory::Path),
                    ring: None,
                    path: Some(vec![[0.0, 60.0], [200.0, 60.0]]),
                },
                AgentSpec {
                    kind: AgentKind::Dwelling,
                    category: None,
                    ring: Some(vec![[90.0, 90.0], [98.0, 90.0], [98.0, 96.0], [90.0, 96.0]]),
                    path: None,
                },
            ],
            influences,
            ..SprawlConfig::default()
        }
    }

    #[test]
    fn attraction_repulsion_has_the_documented_shape() {
        let curve = InfluenceFunction::attraction_repulsion(5.0, 20.0, 40.0).expect("curve");
        assert!((curve.value(0.0) - -1.0).abs() < 1e-12);
        assert!((curve.value(5.0) - -1.0).abs() < 1e-12);
        assert!((curve.value(20.0) - 1.0).abs() < 5e-3);
        assert!((curve.value(40.0)).abs() < 1e-12);
        assert!((curve.value(500.0)).abs() < 1e-12);
        // Fade midpoint sits exactly halfway.
        assert!((curve.value(30.0) - 0.5).abs() < 1e-12);
        // Rising ramp is monotone.
        let mut previous = curve.value(5.0);
        let mut d = 5.5;
        while d < 20.0 {
            let value = curve.value(d);
            assert!(value >= previous, "ramp dipped at {d}");
            previous = value;
            d += 0.5;
        }
    }

    #[test]
    fn open_distance_runs_from_attraction_to_repulsion() {
        let curve = InfluenceFunction::open_distance(10.0, 30.0).expect("curve");
        assert!((curve.value(0.0) - 1.0).abs() < 1e-12);
        assert!((curve.value(9.99) - 1.0).abs() < 1e-12);
        assert!(curve.value(10.01) > 0.99);
        assert!((curve.value(20.0)).abs() < 1e-12);
        assert!(curve.value(29.99) < -0.99);
        assert!((curve.value(30.0) - -1.0).abs() < 1e-12);
        assert!((curve.value(1000.0) - -1.0).abs() < 1e-12);
    }

    #[test]
    fn close_distance_rejects_both_ends() {
        let curve = InfluenceFunction::close_distance(10.0, 30.0).expect("curve");
        assert!((curve.value(0.0) - -1.0).abs() < 1e-12);
        assert!((curve.value(9.99) - -1.0).abs() < 1e-12);
        assert!(curve.value(10.01) > 0.99);
        assert!((curve.value(30.0) - -1.0).abs() < 1e-12);
    }

    #[test]
    fn balance_peaks_between_its_breakpoints() {
        let curve = InfluenceFunction::balance(10.0, 20.0, 40.0).expect("curve");
        assert!((curve.value(10.0) - -1.0).abs() < 1e-12);
        assert!((curve.value(15.0)).abs() < 1e-12);
        assert!(curve.value(19.9) > 0.99);
        assert!(curve.value(20.0) > 0.99);
        assert!((curve.value(30.0)).abs() < 1e-12);
        assert!((curve.value(40.0) - -1.0).abs() < 1e-12);
        assert!((curve.value(90.0) - -1.0).abs() < 1e-12);
    }

    #[test]
    fn builders_reject_unordered_breakpoints() {
        assert!(matches!(
            InfluenceFunction::attraction_repulsion(10.0, 5.0, 40.0),
            Err(InfluenceError::BreakpointsNotAscending { .. })
        ));
        assert!(matches!(
            InfluenceFunction::open_distance(30.0, 10.0),
            Err(InfluenceError::BreakpointsNotAscending { .. })
        ));
        assert!(matches!(
            InfluenceFunction::close_distance(30.0, 10.0),
            Err(InfluenceError::BreakpointsNotAscending { .. })
        ));
        assert!(matches!(
            InfluenceFunction::balance(10.0, 50.0, 40.0),
            Err(InfluenceError::BreakpointsNotAscending { .. })
        ));
    }

    #[test]
    fn equal_breakpoints_collapse_the_ramp() {
        let curve = InfluenceFunction::attraction_repulsion(5.0, 5.0, 5.0).expect("curve");
        assert!((curve.value(5.0) - -1.0).abs() < 1e-12);
        assert!((curve.value(5.01)).abs() < 1e-12);

        let step = InfluenceFunction::open_distance(3.0, 3.0).expect("curve");
        assert!((step.value(2.9) - 1.0).abs() < 1e-12);
        assert!((step.value(3.0) - -1.0).abs() < 1e-12);
    }

    #[test]
    fn ring_neighbours_hit_exact_axis_coordinates() {
        let neighbours: Vec<Point<f64>> = ring_neighbours(Point::new(50.0, 50.0), 10.0).collect();
        assert_eq!(neighbours.len(), 8);
        assert!(neighbours.contains(&Point::new(60.0, 50.0)));
        assert!(neighbours.contains(&Point::new(50.0, 60.0)));
        assert!(neighbours.contains(&Point::new(40.0, 50.0)));
        assert!(neighbours.contains(&Point::new(50.0, 40.0)));
        for neighbour in &neighbours {
            let distance = neighbour.euclidean_distance(&Point::new(50.0, 50.0));
            assert!((distance - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn probe_rectangle_respects_area_and_ratio() {
        let probe = Probe::rectangle(120.0, 1.5, 0.0);
        let footprint = &probe.shape().0[0];
        assert!((footprint.unsigned_area() - 120.0).abs() < 1e-9);
        let bounds = footprint.bounding_rect().expect("bounds");
        let width = bounds.max().x - bounds.min().x;
        let height = bounds.max().y - bounds.min().y;
        assert!((height / width - 1.5).abs() < 1e-9);
    }

    #[test]
    fn placed_probe_lands_on_the_position() {
        let probe = Probe::square(4.0);
        let placed = probe.placed_at(Point::new(10.0, -3.0));
        let centroid = placed.centroid().expect("centroid");
        assert!((centroid.x() - 10.0).abs() < 1e-9);
        assert!((centroid.y() - -3.0).abs() < 1e-9);
        // Rotation keeps the area.
        let rotated = Probe::rectangle(60.0, 0.8, 137.0);
        assert!((rotated.shape().0[0].unsigned_area() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn border_rejects_degenerate_rings() {
        let line = Polygon::new(LineString::from(vec![(0.0, 0.0), (10.0, 0.0)]), Vec::new());
        assert!(matches!(
            Border::new(line),
            Err(WorldError::InvalidConfig(_))
        ));
        let flat = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (20.0, 0.0)]),
            Vec::new(),
        );
        assert!(matches!(
            Border::new(flat),
            Err(WorldError::InvalidConfig(_))
        ));
    }

    #[test]
    fn border_random_points_fall_inside() {
        let border = Border::new(Polygon::new(
            LineString::from(vec![(0.0, 0.0), (80.0, 0.0), (40.0, 60.0)]),
            Vec::new(),
        ))
        .expect("border");
        let mut rng = seeded(3);
        for _ in 0..200 {
            let point = border.random_point(&mut rng);
            assert!(border.contains_point(point));
        }
        assert!((border.greatest_distance() - 80.0f64.hypot(60.0)).abs() < 1e-9);
    }

    #[test]
    fn raster_lookups_follow_the_north_west_layout() {
        let raster = Raster::from_cells(0.0, 2.0, 1.0, 2, 2, None, vec![1.0, 2.0, 3.0, 4.0])
            .expect("raster");
        assert_eq!(raster.value_at(Point::new(0.5, 1.5)), Some(1.0));
        assert_eq!(raster.value_at(Point::new(1.5, 1.5)), Some(2.0));
        assert_eq!(raster.value_at(Point::new(0.5, 0.5)), Some(3.0));
        assert_eq!(raster.value_at(Point::new(1.5, 0.5)), Some(4.0));
        // Eastern and southern edges clamp into the outermost cells.
        assert_eq!(raster.value_at(Point::new(2.0, 0.5)), Some(4.0));
        assert_eq!(raster.value_at(Point::new(2.1, 0.5)), None);
        assert_eq!(raster.value_at(Point::new(0.5, 2.1)), None);
    }

    #[test]
    fn raster_treats_no_data_as_undefined() {
        let raster = Raster::from_cells(
            0.0,
            2.0,
            1.0,
            2,
            2,
            Some(-9999.0),
            vec![1.0, -9999.0, f64::NAN, 4.0],
        )
        .expect("raster");
        assert_eq!(raster.value_at(Point::new(1.5, 1.5)), None);
        assert_eq!(raster.value_at(Point::new(0.5, 0.5)), None);
        assert_eq!(raster.value_at(Point::new(1.5, 0.5)), Some(4.0));
    }

    #[test]
    fn raster_rejects_mismatched_cells() {
        assert!(matches!(
            Raster::from_cells(0.0, 10.0, 1.0, 3, 3, None, vec![0.0; 8]),
            Err(WorldError::InvalidConfig(_))
        ));
        assert!(matches!(
            Raster::from_cells(0.0, 10.0, 0.0, 3, 3, None, vec![0.0; 9]),
            Err(WorldError::InvalidConfig(_))
        ));
    }

    #[test]
    fn plane_slope_matches_its_gradient() {
        let raster =
            Raster::plane(0.0, 100.0, 1.0, 100, 100, 50.0, 0.1, 0.0).expect("raster");
        let footprint = MultiPolygon(vec![square_at(50.0, 50.0, 5.0)]);
        let slope = raster.slope(&footprint).expect("slope");
        assert!((slope - 0.1f64.atan()).abs() < 1e-3);
        assert!(raster.slope_within(&footprint, DEFAULT_MAX_SLOPE));

        let flat = Raster::plane(0.0, 100.0, 1.0, 100, 100, 50.0, 0.0, 0.0).expect("raster");
        assert_eq!(flat.slope(&footprint), Some(0.0));
    }

    #[test]
    fn slope_is_undefined_off_the_raster() {
        let raster = Raster::plane(0.0, 100.0, 1.0, 100, 100, 50.0, 0.1, 0.0).expect("raster");
        let straddling = MultiPolygon(vec![square_at(2.0, 50.0, 5.0)]);
        assert_eq!(raster.slope(&straddling), None);
        assert!(!raster.slope_within(&straddling, DEFAULT_MAX_SLOPE));
    }

    #[test]
    fn multi_part_footprints_report_their_steepest_part() {
        // Flat shelf on the west half, rising ramp on the east half.
        let mut cells = Vec::with_capacity(40 * 40);
        for _row in 0..40 {
            for col in 0..40 {
                let elevation = if col < 20 { 0.0 } else { f64::from(col - 19) };
                cells.push(elevation);
            }
        }
        let raster = Raster::from_cells(0.0, 40.0, 1.0, 40, 40, None, cells).expect("raster");
        let flat_part = square_at(5.0, 20.0, 2.0);
        let steep_part = square_at(30.0, 20.0, 2.0);
        let flat_slope = raster
            .slope(&MultiPolygon(vec![flat_part.clone()]))
            .expect("flat");
        let steep_slope = raster
            .slope(&MultiPolygon(vec![steep_part.clone()]))
            .expect("steep");
        assert!(flat_slope.abs() < 1e-12);
        assert!(steep_slope > 0.0);
        let combined = raster
            .slope(&MultiPolygon(vec![flat_part, steep_part]))
            .expect("combined");
        assert!((combined - steep_slope).abs() < 1e-12);
    }

    #[test]
    fn selector_filters_roads_by_category() {
        let mut book = AgentBook::new();
        book.insert(road_across(10.0, RoadCategory::Path));
        book.insert(road_across(20.0, RoadCategory::Road));
        book.insert(Agent::dwelling(square_at(50.0, 50.0, 4.0)));
        assert_eq!(book.count_of(AgentKind::Road), 2);
        assert_eq!(
            book.geometries_matching(&TargetSelector::of_kind(AgentKind::Road)).len(),
            2
        );
        assert_eq!(
            book.geometries_matching(&TargetSelector::roads_among(&[RoadCategory::Path])).len(),
            1
        );
        assert_eq!(
            book.geometries_matching(&TargetSelector::of_kind(AgentKind::Dwelling)).len(),
            1
        );
    }

    #[test]
    fn distance_influence_applies_its_curve() {
        let mut book = AgentBook::new();
        book.insert(Agent::dwelling(square_at(30.0, 30.0, 2.0)));
        let function = InfluenceFunction::open_distance(5.0, 50.0).expect("curve");
        let mut influence = DistanceInfluence::new(
            "near_dwelling",
            TargetSelector::of_kind(AgentKind::Dwelling),
            function,
            1.0,
        );
        let probe = Probe::square(2.0);
        // Probe at (30, 50): gap between footprints is 49 - 32 = 17.
        let value = influence.evaluate(&book, &probe, Point::new(30.0, 50.0));
        assert!((value - function.value(17.0)).abs() < 1e-9);
        assert_eq!(influence.indexed_targets(), 1);
    }

    #[test]
    fn stale_target_caches_refresh_only_on_reset() {
        let mut book = AgentBook::new();
        let function = InfluenceFunction::open_distance(5.0, 50.0).expect("curve");
        let mut influence = DistanceInfluence::new(
            "near_dwelling",
            TargetSelector::of_kind(AgentKind::Dwelling),
            function,
            1.0,
        );
        let probe = Probe::square(2.0);
        let position = Point::new(30.0, 50.0);
        // No targets yet: vetoed.
        assert!((influence.evaluate(&book, &probe, position) - VETO_SCORE).abs() < 1e-12);
        book.insert(Agent::dwelling(square_at(30.0, 30.0, 2.0)));
        // Still vetoed: the epoch's index snapshot predates the insert.
        assert!((influence.evaluate(&book, &probe, position) - VETO_SCORE).abs() < 1e-12);
        influence.reset();
        let value = influence.evaluate(&book, &probe, position);
        assert!((value - function.value(17.0)).abs() < 1e-9);
    }

    #[test]
    fn a_single_veto_sinks_the_whole_aggregate() {
        let mut field = InfluenceField::new(vec![
            Box::new(ConstInfluence { value: 1.0, weight: 0.5 }),
            Box::new(ConstInfluence { value: -1.0, weight: 0.5 }),
        ]);
        let book = AgentBook::new();
        let probe = Probe::square(2.0);
        let score = field.score(&book, &probe, Point::new(0.0, 0.0));
        assert!((score - VETO_SCORE).abs() < 1e-12);

        // Veto applies on the raw value, before weighting.
        let mut weightless = InfluenceField::new(vec![Box::new(ConstInfluence {
            value: -1.0,
            weight: 0.0,
        })]);
        let score = weightless.score(&book, &probe, Point::new(0.0, 0.0));
        assert!((score - VETO_SCORE).abs() < 1e-12);
    }

    #[test]
    fn aggregate_is_the_weighted_sum() {
        let mut field = InfluenceField::new(vec![
            Box::new(ConstInfluence { value: 0.4, weight: 0.5 }),
            Box::new(ConstInfluence { value: 0.8, weight: 0.25 }),
        ]);
        let book = AgentBook::new();
        let probe = Probe::square(2.0);
        let score = field.score(&book, &probe, Point::new(0.0, 0.0));
        assert!((score - 0.4).abs() < 1e-12);
        assert!((field.total_weight() - 0.75).abs() < 1e-12);

        let mut empty = InfluenceField::new(Vec::new());
        assert!((empty.score(&book, &probe, Point::new(0.0, 0.0))).abs() < 1e-12);
    }

    #[test]
    fn climb_finds_the_peak() {
        let border = Border::new(square_at(50.0, 50.0, 50.0)).expect("border");
        let mut field = InfluenceField::new(vec![Box::new(PeakInfluence {
            center: Point::new(50.0, 50.0),
            scale: 100.0,
        })]);
        let book = AgentBook::new();
        let probe = Probe::square(2.0);
        let mut rng = seeded(5);
        let found = field
            .search_site(&book, &border, &probe, &mut rng)
            .expect("search");
        let distance = found.position.euclidean_distance(&Point::new(50.0, 50.0));
        assert!(distance < 5.0, "ended {distance} from the peak");
        assert!(found.score > 0.9);
    }

    #[test]
    fn fully_vetoed_fields_report_no_start_point() {
        let border = Border::new(square_at(50.0, 50.0, 50.0)).expect("border");
        let mut field = InfluenceField::new(vec![Box::new(ConstInfluence {
            value: -1.0,
            weight: 1.0,
        })]);
        let book = AgentBook::new();
        let probe = Probe::square(2.0);
        let mut rng = seeded(5);
        let result = field.search_site(&book, &border, &probe, &mut rng);
        assert_eq!(
            result,
            Err(SearchError::NoValidStartPoint { attempts: 100 })
        );
        let batched = field.search_site_batched(&book, &border, &probe, &mut rng, 3);
        assert_eq!(
            batched,
            Err(SearchError::NoValidStartPoint { attempts: 300 })
        );
    }

    #[test]
    fn batched_search_survives_failed_restarts() {
        // Left half of the border is vetoed; some restarts will still find
        // the buildable right half.
        let border = Border::new(square_at(50.0, 50.0, 50.0)).expect("border");
        let mut field = InfluenceField::new(vec![Box::new(GateInfluence { threshold: 50.0 })]);
        let book = AgentBook::new();
        let probe = Probe::square(2.0);
        let mut rng = seeded(7);
        let found = field
            .search_site_batched(&book, &border, &probe, &mut rng, 6)
            .expect("batched search");
        assert!(found.position.x() >= 50.0);
    }

    #[test]
    fn batched_search_never_loses_to_its_first_restart() {
        let border = Border::new(square_at(50.0, 50.0, 50.0)).expect("border");
        let book = AgentBook::new();
        let probe = Probe::square(2.0);
        let peak = || {
            InfluenceField::new(vec![Box::new(PeakInfluence {
                center: Point::new(72.0, 31.0),
                scale: 150.0,
            }) as Box<dyn Influence>])
        };
        let mut single_rng = seeded(13);
        let single = peak()
            .search_site_with(&book, &border, &probe, &mut single_rng, SearchParams::restart())
            .expect("single");
        let mut batched_rng = seeded(13);
        let batched = peak()
            .search_site_batched(&book, &border, &probe, &mut batched_rng, 5)
            .expect("batched");
        assert!(batched.score >= single.score - 1e-12);
    }

    #[test]
    fn default_config_builds_an_inert_world() {
        let config = SprawlConfig {
            rng_seed: Some(1),
            ..SprawlConfig::default()
        };
        let mut world = World::new(config).expect("world");
        assert_eq!(world.tick(), Tick(0));
        assert_eq!(world.registry().len(), 0);
        let summary = world.step();
        assert_eq!(summary.tick, Tick(1));
        assert_eq!(summary.placed, 0);
        assert_eq!(summary.mean_site_score, None);
    }

    #[test]
    fn config_validation_catches_the_usual_mistakes() {
        let mut bad_weight = scenario_config();
        if let Some(specs) = bad_weight.influences.get_mut("house_building") {
            if let EvaluatorSpec::Distance { weight, .. } = &mut specs[0] {
                *weight = 1.5;
            }
        }
        assert!(matches!(
            bad_weight.validate(),
            Err(WorldError::InvalidConfig(_))
        ));

        let mut inverted = scenario_config();
        inverted.growth.area_min = 90.0;
        inverted.growth.area_max = 40.0;
        assert!(matches!(
            inverted.validate(),
            Err(WorldError::InvalidConfig(_))
        ));

        let mut no_restarts = scenario_config();
        no_restarts.search.restarts = 0;
        assert!(matches!(
            no_restarts.validate(),
            Err(WorldError::InvalidConfig(_))
        ));

        let mut unknown_growth = scenario_config();
        unknown_growth.growth.influence = "missing".to_owned();
        assert!(matches!(
            unknown_growth.validate(),
            Err(WorldError::InvalidConfig(_))
        ));

        let mut bad_breakpoints = scenario_config();
        if let Some(specs) = bad_breakpoints.influences.get_mut("house_building") {
            if let EvaluatorSpec::Distance { function, .. } = &mut specs[0] {
                function.l_zero = Some(1.0);
            }
        }
        assert!(matches!(
            bad_breakpoints.validate(),
            Err(WorldError::Influence(InfluenceError::BreakpointsNotAscending { .. }))
        ));
    }

    #[test]
    fn slope_specs_require_a_known_raster() {
        let mut config = scenario_config();
        config.rasters.clear();
        assert_eq!(
            World::new(config).err(),
            Some(WorldError::UnknownRaster("topography".to_owned()))
        );
    }

    #[test]
    fn function_specs_enforce_their_breakpoint_arity() {
        let missing = FunctionSpec {
            curve: CurveKind::Balance,
            l_min: 1.0,
            l_zero: None,
            l_max: 10.0,
        };
        assert!(matches!(
            missing.build(),
            Err(InfluenceError::MissingBreakpoint { .. })
        ));
        let extra = FunctionSpec {
            curve: CurveKind::OpenDistance,
            l_min: 1.0,
            l_zero: Some(5.0),
            l_max: 10.0,
        };
        assert!(matches!(
            extra.build(),
            Err(InfluenceError::ExtraBreakpoint { .. })
        ));
    }

    #[test]
    fn scenario_world_scores_and_sites() {
        let mut world = World::new(scenario_config()).expect("world");
        let probe = Probe::square(6.0);
        let score = world
            .score("house_building", &probe, Point::new(100.0, 60.0))
            .expect("score");
        assert!((-1.0..=1.0).contains(&score));
        let site = world.find_site("house_building", &probe).expect("site");
        assert!(world.border().contains_point(site));
        let batched = world
            .find_site_batched("house_building", &probe, 3)
            .expect("batched site");
        assert!(world.border().contains_point(batched));
    }

    #[test]
    fn unknown_influence_names_error() {
        let mut world = World::new(scenario_config()).expect("world");
        let probe = Probe::square(4.0);
        assert_eq!(
            world.score("nope", &probe, Point::new(0.0, 0.0)).err(),
            Some(WorldError::UnknownInfluence("nope".to_owned()))
        );
    }

    #[test]
    fn grown_dwellings_land_inside_the_border() {
        let mut world = World::new(scenario_config()).expect("world");
        let before = world.dwelling_count();
        let id = world.grow_dwelling("house_building", 64.0).expect("grow");
        assert_eq!(world.dwelling_count(), before + 1);
        let agent = world.registry().get(id).expect("agent");
        let Geometry::Polygon(footprint) = &agent.geometry else {
            panic!("dwelling geometry should be a polygon");
        };
        assert!((footprint.unsigned_area() - 64.0).abs() < 1e-6);
        assert!(
            world
                .border()
                .contains_footprint(&MultiPolygon(vec![footprint.clone()]))
        );
    }

    #[test]
    fn builds_fail_when_no_footprint_fits() {
        // A sliver border: searches succeed but a 20 x 20 footprint can
        // never sit inside it.
        let config = SprawlConfig {
            border: vec![[0.0, 0.0], [100.0, 0.0], [100.0, 4.0], [0.0, 4.0]],
            rng_seed: Some(2),
            ..SprawlConfig::default()
        };
        let mut world = World::new(config).expect("world");
        world.set_influence("flat", InfluenceField::new(Vec::new()));
        assert_eq!(
            world.grow_dwelling("flat", 400.0).err(),
            Some(WorldError::ImpossibleBuild { tries: 5 })
        );
    }

    #[test]
    fn step_accounts_for_every_attempt() {
        let mut world = World::new(scenario_config()).expect("world");
        let summary = world.step();
        assert_eq!(summary.tick, Tick(1));
        assert_eq!(summary.placed + summary.failed, 2);
        assert_eq!(summary.dwellings, 1 + summary.placed as usize);
        if summary.placed > 0 {
            let mean = summary.mean_site_score.expect("mean score");
            assert!((-1.0..=1.0).contains(&mean));
        }
        assert_eq!(world.history().count(), 1);
    }

    #[test]
    fn seeded_worlds_replay_identically() {
        let mut left = World::new(scenario_config()).expect("left world");
        let mut right = World::new(scenario_config()).expect("right world");
        for _ in 0..3 {
            assert_eq!(left.step(), right.step());
        }
        let geometries = |world: &World| -> Vec<Geometry<f64>> {
            world
                .registry()
                .of_kind(AgentKind::Dwelling)
                .map(|(_, agent)| agent.geometry.clone())
                .collect()
        };
        assert_eq!(geometries(&left), geometries(&right));
    }

    #[test]
    fn removing_the_last_target_vetoes_after_reset() {
        let config = SprawlConfig {
            rng_seed: Some(4),
            ..SprawlConfig::default()
        };
        let mut world = World::new(config).expect("world");
        let id = world.add_agent(Agent::dwelling(square_at(50.0, 50.0, 4.0)));
        let function = InfluenceFunction::open_distance(5.0, 80.0).expect("curve");
        world.set_influence(
            "neighbours",
            InfluenceField::new(vec![Box::new(DistanceInfluence::new(
                "near_dwelling",
                TargetSelector::of_kind(AgentKind::Dwelling),
                function,
                1.0,
            ))]),
        );
        let probe = Probe::square(3.0);
        let position = Point::new(20.0, 50.0);
        let with_target = world.score("neighbours", &probe, position).expect("score");
        assert!(with_target > VETO_SCORE);
        world.remove_agent(id);
        // Stale snapshot until the reset.
        let stale = world.score("neighbours", &probe, position).expect("score");
        assert!((stale - with_target).abs() < 1e-12);
        world.reset_influences();
        let emptied = world.score("neighbours", &probe, position).expect("score");
        assert!((emptied - VETO_SCORE).abs() < 1e-12);
    }

    #[test]
    fn rendered_maps_scan_from_the_north_west() {
        let mut world = World::new(scenario_config()).expect("world");
        let probe = Probe::square(PREVIEW_PROBE_EDGE);
        let map = world
            .render_influence_map("house_building", &probe, 20.0)
            .expect("map");
        assert_eq!(map.width(), 10);
        assert_eq!(map.height(), 10);
        assert_eq!(map.values().len(), 100);
        let corner = map.value(0, 0).expect("corner");
        let expected = world
            .score("house_building", &probe, Point::new(0.0, 200.0))
            .expect("score");
        assert!((corner - expected).abs() < 1e-12);
        // Rendering twice gives the same surface.
        let again = world
            .render_influence_map("house_building", &probe, 20.0)
            .expect("map");
        assert_eq!(map, again);
        assert_eq!(map.to_gray().len(), 100);
    }
}
