//! Static campus polygon and point containment
//!
//! The polygon is loaded once from config and never changes afterwards.
//! Vertices are (latitude, longitude) pairs; the ring is closed implicitly
//! by returning to the first vertex.

use crate::domain::types::Coordinate;
use thiserror::Error;

/// Minimum vertex count for a closed polygon
const MIN_VERTICES: usize = 3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeofenceError {
    #[error("geofence needs at least {MIN_VERTICES} distinct vertices, got {0}")]
    TooFewVertices(usize),
    #[error("geofence vertex {0} is not a finite latitude/longitude")]
    NonFiniteVertex(usize),
}

/// Axis-aligned bounds used to short-circuit the ray cast
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
}

impl Bounds {
    fn of(vertices: &[Coordinate]) -> Self {
        let mut bounds = Self {
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
        };
        for v in vertices {
            bounds.min_lat = bounds.min_lat.min(v.latitude);
            bounds.max_lat = bounds.max_lat.max(v.latitude);
            bounds.min_lon = bounds.min_lon.min(v.longitude);
            bounds.max_lon = bounds.max_lon.max(v.longitude);
        }
        bounds
    }

    #[inline]
    fn contains(&self, p: Coordinate) -> bool {
        p.latitude >= self.min_lat
            && p.latitude <= self.max_lat
            && p.longitude >= self.min_lon
            && p.longitude <= self.max_lon
    }
}

/// Simple polygon (no holes) tested with the even-odd ray casting rule
#[derive(Debug, Clone)]
pub struct Geofence {
    vertices: Vec<Coordinate>,
    bounds: Bounds,
}

impl Geofence {
    pub fn new(mut vertices: Vec<Coordinate>) -> Result<Self, GeofenceError> {
        if let Some(idx) =
            vertices.iter().position(|v| !v.latitude.is_finite() || !v.longitude.is_finite())
        {
            return Err(GeofenceError::NonFiniteVertex(idx));
        }

        // Accept an explicitly closed ring as well
        if vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }

        if vertices.len() < MIN_VERTICES {
            return Err(GeofenceError::TooFewVertices(vertices.len()));
        }

        let bounds = Bounds::of(&vertices);
        Ok(Self { vertices, bounds })
    }

    /// Build from vertices already known to be valid (built-in defaults)
    pub(crate) fn new_unchecked(vertices: Vec<Coordinate>) -> Self {
        let bounds = Bounds::of(&vertices);
        Self { vertices, bounds }
    }

    /// Build from `[lat, lon]` pairs as they appear in TOML
    pub fn from_pairs(pairs: &[[f64; 2]]) -> Result<Self, GeofenceError> {
        Self::new(pairs.iter().map(|&[lat, lon]| Coordinate::new(lat, lon)).collect())
    }

    pub fn vertices(&self) -> &[Coordinate] {
        &self.vertices
    }

    /// Whether `p` lies inside the polygon
    ///
    /// Points exactly on an edge may fall either way; the campus boundary
    /// is far coarser than GPS precision.
    pub fn contains(&self, p: Coordinate) -> bool {
        if !self.bounds.contains(p) {
            return false;
        }

        let (x, y) = (p.longitude, p.latitude);
        let mut inside = false;
        let mut j = self.vertices.len() - 1;

        for i in 0..self.vertices.len() {
            let (xi, yi) = (self.vertices[i].longitude, self.vertices[i].latitude);
            let (xj, yj) = (self.vertices[j].longitude, self.vertices[j].latitude);

            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }

        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campus_quad() -> Geofence {
        Geofence::from_pairs(&[
            [20.6105, -103.4175],
            [20.6100, -103.4075],
            [20.6058, -103.4082],
            [20.6062, -103.4168],
        ])
        .unwrap()
    }

    #[test]
    fn test_campus_points() {
        let fence = campus_quad();
        assert!(fence.contains(Coordinate::new(20.6075, -103.4105)));
        assert!(!fence.contains(Coordinate::new(20.6050, -103.4150)));
    }

    #[test]
    fn test_point_inside_bounds_but_outside_polygon() {
        // Triangle: the bounding box corner is not part of the polygon
        let fence = Geofence::from_pairs(&[[0.0, 0.0], [0.0, 10.0], [10.0, 0.0]]).unwrap();
        assert!(fence.contains(Coordinate::new(2.0, 2.0)));
        assert!(!fence.contains(Coordinate::new(9.0, 9.0)));
    }

    #[test]
    fn test_concave_polygon() {
        // U shape opening north; the notch is outside
        let fence = Geofence::from_pairs(&[
            [0.0, 0.0],
            [0.0, 3.0],
            [3.0, 3.0],
            [3.0, 2.0],
            [1.0, 2.0],
            [1.0, 1.0],
            [3.0, 1.0],
            [3.0, 0.0],
        ])
        .unwrap();
        assert!(fence.contains(Coordinate::new(0.5, 1.5)));
        assert!(fence.contains(Coordinate::new(2.0, 0.5)));
        assert!(!fence.contains(Coordinate::new(2.0, 1.5)));
    }

    #[test]
    fn test_closed_ring_is_normalized() {
        let fence =
            Geofence::from_pairs(&[[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]]).unwrap();
        assert_eq!(fence.vertices().len(), 3);
    }

    #[test]
    fn test_too_few_vertices() {
        assert_eq!(
            Geofence::from_pairs(&[[0.0, 0.0], [1.0, 1.0]]).unwrap_err(),
            GeofenceError::TooFewVertices(2)
        );
        assert_eq!(
            Geofence::from_pairs(&[[0.0, 0.0], [1.0, 1.0], [0.0, 0.0]]).unwrap_err(),
            GeofenceError::TooFewVertices(2)
        );
    }

    #[test]
    fn test_non_finite_vertex() {
        assert_eq!(
            Geofence::from_pairs(&[[0.0, 0.0], [f64::NAN, 1.0], [1.0, 0.0]]).unwrap_err(),
            GeofenceError::NonFiniteVertex(1)
        );
    }
}
