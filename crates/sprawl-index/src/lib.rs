//! Spatial indexes answering nearest-geometry queries for the sprawl engine.
//!
//! Influence evaluation asks one question over and over: given a candidate
//! building footprint, how far is it from the nearest road, river, or
//! neighbouring dwelling? The [`ProximityIndex`] trait captures that query so
//! the evaluation layer can swap backends. [`LinearScanIndex`] is the obvious
//! baseline and doubles as the oracle in tests; [`RTreeIndex`] is the backend
//! used in practice.
//!
//! Indexed geometries are decomposed into single-part primitives before
//! insertion, so multi-part inputs (a river with braided channels, a road
//! network collection) cost nothing special at query time.

use geo::{
    BoundingRect, Centroid, EuclideanDistance, Geometry, LineString, MultiPolygon, Point, Polygon,
    Rect,
};
use rstar::{AABB, PointDistance, RTree, RTreeObject};

/// A single-part primitive held by an index.
///
/// Multi-geometries are flattened into these at build time; degenerate parts
/// (empty rings, zero-point lines) are dropped.
#[derive(Clone, Debug, PartialEq)]
pub enum TargetPart {
    Point(Point<f64>),
    Line(LineString<f64>),
    Area(Polygon<f64>),
}

impl TargetPart {
    /// Planar distance from this part to a point. Zero if the point lies on
    /// or inside the part.
    #[must_use]
    pub fn distance_to_point(&self, point: &Point<f64>) -> f64 {
        match self {
            TargetPart::Point(p) => point.euclidean_distance(p),
            TargetPart::Line(line) => point.euclidean_distance(line),
            TargetPart::Area(area) => point.euclidean_distance(area),
        }
    }

    /// Planar distance from this part to a polygon. Zero if they touch or
    /// overlap.
    #[must_use]
    pub fn distance_to_polygon(&self, polygon: &Polygon<f64>) -> f64 {
        match self {
            TargetPart::Point(p) => p.euclidean_distance(polygon),
            TargetPart::Line(line) => line.euclidean_distance(polygon),
            TargetPart::Area(area) => area.euclidean_distance(polygon),
        }
    }

    fn bounds(&self) -> Option<Rect<f64>> {
        match self {
            TargetPart::Point(p) => Some(p.bounding_rect()),
            TargetPart::Line(line) => line.bounding_rect(),
            TargetPart::Area(area) => area.bounding_rect(),
        }
    }
}

/// Flattens a geometry into indexable single-part primitives, appending them
/// to `out`. Collections recurse; degenerate parts are skipped.
pub fn decompose(geometry: &Geometry<f64>, out: &mut Vec<TargetPart>) {
    match geometry {
        Geometry::Point(p) => out.push(TargetPart::Point(*p)),
        Geometry::MultiPoint(points) => {
            out.extend(points.iter().map(|p| TargetPart::Point(*p)));
        }
        Geometry::Line(line) => {
            out.push(TargetPart::Line(LineString::new(vec![line.start, line.end])));
        }
        Geometry::LineString(line) => {
            if line.0.len() >= 2 {
                out.push(TargetPart::Line(line.clone()));
            }
        }
        Geometry::MultiLineString(lines) => {
            out.extend(
                lines
                    .iter()
                    .filter(|line| line.0.len() >= 2)
                    .map(|line| TargetPart::Line(line.clone())),
            );
        }
        Geometry::Polygon(polygon) => {
            if polygon.exterior().0.len() >= 4 {
                out.push(TargetPart::Area(polygon.clone()));
            }
        }
        Geometry::MultiPolygon(polygons) => {
            out.extend(
                polygons
                    .iter()
                    .filter(|polygon| polygon.exterior().0.len() >= 4)
                    .map(|polygon| TargetPart::Area(polygon.clone())),
            );
        }
        Geometry::GeometryCollection(collection) => {
            for inner in collection {
                decompose(inner, out);
            }
        }
        Geometry::Rect(rect) => out.push(TargetPart::Area(rect.to_polygon())),
        Geometry::Triangle(triangle) => out.push(TargetPart::Area(triangle.to_polygon())),
    }
}

fn decompose_all(targets: &[Geometry<f64>]) -> Vec<TargetPart> {
    let mut parts = Vec::with_capacity(targets.len());
    for geometry in targets {
        decompose(geometry, &mut parts);
    }
    parts
}

/// Shared behaviour for nearest-geometry indexes.
///
/// Implementations must agree on semantics: [`nearest_distance`] returns the
/// minimum planar distance between any part of the probe footprint and any
/// indexed part, `None` when the index holds nothing. Overlap is distance
/// zero.
///
/// [`nearest_distance`]: ProximityIndex::nearest_distance
pub trait ProximityIndex {
    /// Replaces the index contents with the given target geometries.
    fn rebuild(&mut self, targets: &[Geometry<f64>]);

    /// Minimum distance from the probe footprint to the nearest indexed part.
    fn nearest_distance(&self, probe: &MultiPolygon<f64>) -> Option<f64>;

    /// Number of single-part primitives currently indexed.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Brute-force baseline: scans every indexed part per query.
///
/// Fine for small target sets and for cross-checking the tree index.
#[derive(Clone, Debug, Default)]
pub struct LinearScanIndex {
    parts: Vec<TargetPart>,
}

impl LinearScanIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index straight from target geometries.
    #[must_use]
    pub fn bulk_load(targets: &[Geometry<f64>]) -> Self {
        Self {
            parts: decompose_all(targets),
        }
    }
}

impl ProximityIndex for LinearScanIndex {
    fn rebuild(&mut self, targets: &[Geometry<f64>]) {
        self.parts = decompose_all(targets);
    }

    fn nearest_distance(&self, probe: &MultiPolygon<f64>) -> Option<f64> {
        let mut best: Option<f64> = None;
        for footprint in &probe.0 {
            for part in &self.parts {
                let distance = part.distance_to_polygon(footprint);
                if best.is_none_or(|current| distance < current) {
                    best = Some(distance);
                }
            }
        }
        best
    }

    fn len(&self) -> usize {
        self.parts.len()
    }
}

/// An indexed part plus its precomputed envelope for tree insertion.
#[derive(Clone, Debug)]
struct IndexedPart {
    part: TargetPart,
    bounds: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedPart {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds
    }
}

impl PointDistance for IndexedPart {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let distance = self
            .part
            .distance_to_point(&Point::new(point[0], point[1]));
        distance * distance
    }
}

/// R-tree backed index.
///
/// Candidates come back from the tree ordered by exact distance to the probe
/// part's centroid; the scan refines each candidate with an exact
/// part-to-polygon distance and stops once the centroid-distance lower bound
/// (centroid distance minus the part's circumradius) can no longer beat the
/// best exact distance found.
#[derive(Clone, Debug, Default)]
pub struct RTreeIndex {
    tree: RTree<IndexedPart>,
}

impl RTreeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index straight from target geometries.
    #[must_use]
    pub fn bulk_load(targets: &[Geometry<f64>]) -> Self {
        Self {
            tree: RTree::bulk_load(indexed_parts(targets)),
        }
    }
}

fn indexed_parts(targets: &[Geometry<f64>]) -> Vec<IndexedPart> {
    decompose_all(targets)
        .into_iter()
        .filter_map(|part| {
            let rect = part.bounds()?;
            let bounds = AABB::from_corners(
                [rect.min().x, rect.min().y],
                [rect.max().x, rect.max().y],
            );
            Some(IndexedPart { part, bounds })
        })
        .collect()
}

impl ProximityIndex for RTreeIndex {
    fn rebuild(&mut self, targets: &[Geometry<f64>]) {
        self.tree = RTree::bulk_load(indexed_parts(targets));
    }

    fn nearest_distance(&self, probe: &MultiPolygon<f64>) -> Option<f64> {
        if self.tree.size() == 0 {
            return None;
        }
        let mut best: Option<f64> = None;
        for footprint in &probe.0 {
            let Some(center) = footprint.centroid() else {
                continue;
            };
            // Max distance from the centroid to the footprint boundary; the
            // footprint can beat a centroid distance by at most this much.
            let reach = footprint
                .exterior()
                .coords()
                .map(|c| (c.x - center.x()).hypot(c.y - center.y()))
                .fold(0.0f64, f64::max);
            let query = [center.x(), center.y()];
            for (candidate, centroid_distance_2) in
                self.tree.nearest_neighbor_iter_with_distance_2(&query)
            {
                if let Some(current) = best {
                    if centroid_distance_2.sqrt() - reach > current {
                        break;
                    }
                }
                let distance = candidate.part.distance_to_polygon(footprint);
                if best.is_none_or(|current| distance < current) {
                    best = Some(distance);
                }
            }
        }
        best
    }

    fn len(&self) -> usize {
        self.tree.size()
    }
}
