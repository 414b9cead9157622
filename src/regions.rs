//! Named regions loaded from GeoJSON, with point-in-polygon lookup.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use geo::{Contains, Coord, LineString, MultiPolygon, Point, Polygon};
use serde::Deserialize;
use simd_json::prelude::*;
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{LocationEstimate, UserId};
use crate::utils::warn_once;

pub trait RegionLookup: Send + Sync {
    /// Whether `region` contains the point. Unknown regions contain nothing.
    fn contains(&self, region: &str, latitude: f64, longitude: f64) -> bool;

    /// All region names, sorted.
    fn regions(&self) -> Vec<String>;

    /// First region (by name) containing the point.
    fn region_of(&self, latitude: f64, longitude: f64) -> Option<String> {
        self.regions()
            .into_iter()
            .find(|region| self.contains(region, latitude, longitude))
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Option<simd_json::OwnedValue>,
    #[serde(default)]
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Option<simd_json::OwnedValue>,
}

#[derive(Debug, Default)]
pub struct GeoJsonRegions {
    shapes: BTreeMap<String, MultiPolygon<f64>>,
}

impl GeoJsonRegions {
    /// Load a `FeatureCollection`, grouping `Polygon` and `MultiPolygon`
    /// features by the string property `name_property`.
    ///
    /// Features without the property or with other geometry types are skipped.
    pub fn load(path: &Path, name_property: &str) -> Result<Self> {
        let mut bytes = std::fs::read(path)
            .map_err(|e| Error::Region(format!("cannot read {}: {e}", path.display())))?;
        let regions = Self::from_slice(&mut bytes, name_property)?;
        info!(
            "loaded {} regions from {}",
            regions.shapes.len(),
            path.display()
        );
        Ok(regions)
    }

    pub fn from_slice(bytes: &mut [u8], name_property: &str) -> Result<Self> {
        let collection: FeatureCollection = simd_json::from_slice(bytes)
            .map_err(|e| Error::Region(format!("invalid GeoJSON: {e}")))?;

        let mut shapes: BTreeMap<String, MultiPolygon<f64>> = BTreeMap::new();
        for (index, feature) in collection.features.into_iter().enumerate() {
            let Some(name) = feature
                .properties
                .as_ref()
                .and_then(|p| p.get(name_property))
                .and_then(|v| v.as_str())
                .map(str::to_string)
            else {
                warn_once(format!("feature {index} has no {name_property:?} property"));
                continue;
            };
            let Some(geometry) = feature.geometry else {
                continue;
            };
            let polygons = match (geometry.kind.as_str(), geometry.coordinates.as_ref()) {
                ("Polygon", Some(coordinates)) => vec![polygon(coordinates)?],
                ("MultiPolygon", Some(coordinates)) => array(coordinates)?
                    .iter()
                    .map(polygon)
                    .collect::<Result<Vec<_>>>()?,
                (kind, _) => {
                    warn_once(format!("skipping {kind} geometry of region {name}"));
                    continue;
                }
            };
            shapes.entry(name).or_insert_with(|| MultiPolygon(Vec::new())).0.extend(polygons);
        }
        Ok(Self { shapes })
    }
}

fn array(value: &simd_json::OwnedValue) -> Result<&Vec<simd_json::OwnedValue>> {
    value
        .as_array()
        .ok_or_else(|| Error::Region("expected a coordinate array".to_string()))
}

fn ring(value: &simd_json::OwnedValue) -> Result<LineString<f64>> {
    let coords = array(value)?
        .iter()
        .map(|position| {
            let position = array(position)?;
            match (
                position.first().and_then(|v| v.cast_f64()),
                position.get(1).and_then(|v| v.cast_f64()),
            ) {
                (Some(x), Some(y)) => Ok(Coord { x, y }),
                _ => Err(Error::Region("position needs two numbers".to_string())),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LineString::new(coords))
}

fn polygon(value: &simd_json::OwnedValue) -> Result<Polygon<f64>> {
    let mut rings = array(value)?.iter().map(ring);
    let exterior = rings
        .next()
        .ok_or_else(|| Error::Region("polygon without rings".to_string()))??;
    let interiors = rings.collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

impl RegionLookup for GeoJsonRegions {
    fn contains(&self, region: &str, latitude: f64, longitude: f64) -> bool {
        match self.shapes.get(region) {
            Some(shape) => shape.contains(&Point::new(longitude, latitude)),
            None => {
                warn_once(format!("unknown region {region:?}"));
                false
            }
        }
    }

    fn regions(&self) -> Vec<String> {
        self.shapes.keys().cloned().collect()
    }
}

/// Estimated users per region; users outside every region are counted in the second value.
pub fn count_by_region(
    lookup: &dyn RegionLookup,
    estimates: &[LocationEstimate],
) -> (BTreeMap<String, usize>, usize) {
    let mut counts: BTreeMap<String, usize> =
        lookup.regions().into_iter().map(|r| (r, 0)).collect();
    let mut outside = 0;
    for estimate in estimates {
        match lookup.region_of(estimate.latitude, estimate.longitude) {
            Some(region) => *counts.entry(region).or_default() += 1,
            None => outside += 1,
        }
    }
    (counts, outside)
}

/// Users whose estimate falls inside `region`.
pub fn users_in_region(
    lookup: &dyn RegionLookup,
    region: &str,
    estimates: &[LocationEstimate],
) -> HashSet<UserId> {
    estimates
        .iter()
        .filter(|e| lookup.contains(region, e.latitude, e.longitude))
        .map(|e| e.user_id)
        .collect()
}
