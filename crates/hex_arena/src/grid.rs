//! Axial hex coordinates and the finite session grid.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Axial hex coordinate. Serializes as the canonical string `"q,r"` in
/// every position so that `Coord`-keyed maps stay valid JSON objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coord {
    pub q: i64,
    pub r: i64,
}

impl Coord {
    pub fn new(q: i64, r: i64) -> Self {
        Self { q, r }
    }

    /// Hex distance from the origin in axial coordinates.
    pub fn distance_from_origin(self) -> i64 {
        (self.q.abs() + self.r.abs() + (self.q + self.r).abs()) / 2
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.q, self.r)
    }
}

impl FromStr for Coord {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (q, r) = raw
            .split_once(',')
            .ok_or_else(|| format!("invalid coord: {raw}"))?;
        let q = q
            .trim()
            .parse::<i64>()
            .map_err(|err| format!("invalid coord q in {raw}: {err}"))?;
        let r = r
            .trim()
            .parse::<i64>()
            .map_err(|err| format!("invalid coord r in {raw}: {err}"))?;
        Ok(Self { q, r })
    }
}

impl Serialize for Coord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Coord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Axial displacement. Unlike `Coord` this is never used as a map key and
/// serializes as a plain struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HexVector {
    pub q: i64,
    pub r: i64,
}

impl HexVector {
    pub fn new(q: i64, r: i64) -> Self {
        Self { q, r }
    }
}

/// Apply a displacement to a coordinate.
pub fn apply_vector(coord: Coord, vector: HexVector) -> Coord {
    Coord {
        q: coord.q + vector.q,
        r: coord.r + vector.r,
    }
}

fn default_hex_kind() -> String {
    "plain".to_string()
}

/// Grid cell metadata. Extensible; the identity is the keying `Coord`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hex {
    #[serde(default = "default_hex_kind")]
    pub kind: String,
}

impl Default for Hex {
    fn default() -> Self {
        Self {
            kind: default_hex_kind(),
        }
    }
}

/// Finite map of hexes. Immutable once the world is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Grid {
    hexes: BTreeMap<Coord, Hex>,
}

impl Grid {
    pub fn from_hexes(hexes: BTreeMap<Coord, Hex>) -> Self {
        Self { hexes }
    }

    /// Disc of the given radius around the origin, the default session map.
    pub fn hex_disc(radius: i64) -> Self {
        let mut hexes = BTreeMap::new();
        for q in -radius..=radius {
            for r in -radius..=radius {
                let coord = Coord::new(q, r);
                if coord.distance_from_origin() <= radius {
                    hexes.insert(coord, Hex::default());
                }
            }
        }
        Self { hexes }
    }

    pub fn contains(&self, coord: Coord) -> bool {
        self.hexes.contains_key(&coord)
    }

    pub fn get(&self, coord: Coord) -> Option<&Hex> {
        self.hexes.get(&coord)
    }

    /// Coordinates in ascending `(q, r)` order.
    pub fn coords(&self) -> impl Iterator<Item = Coord> + '_ {
        self.hexes.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.hexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hexes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_vector_adds_components() {
        let coord = apply_vector(Coord::new(-1, 0), HexVector::new(1, 0));
        assert_eq!(coord, Coord::new(0, 0));
        let coord = apply_vector(Coord::new(0, 1), HexVector::new(0, -1));
        assert_eq!(coord, Coord::new(0, 0));
    }

    #[test]
    fn coord_string_round_trip() {
        for coord in [Coord::new(0, 0), Coord::new(-3, 7), Coord::new(12, -5)] {
            let encoded = coord.to_string();
            let decoded = encoded.parse::<Coord>().expect("parse coord");
            assert_eq!(decoded, coord);
        }
    }

    #[test]
    fn coord_rejects_garbage() {
        assert!("".parse::<Coord>().is_err());
        assert!("1".parse::<Coord>().is_err());
        assert!("a,b".parse::<Coord>().is_err());
    }

    #[test]
    fn coord_serializes_as_string_map_key() {
        let mut map = BTreeMap::new();
        map.insert(Coord::new(-1, 2), 7u32);
        let json = serde_json::to_string(&map).expect("serialize");
        assert_eq!(json, r#"{"-1,2":7}"#);
        let back: BTreeMap<Coord, u32> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, map);
    }

    #[test]
    fn hex_disc_has_expected_cell_count() {
        // A disc of radius r holds 3r(r+1)+1 hexes.
        for radius in 0..4 {
            let grid = Grid::hex_disc(radius);
            assert_eq!(grid.len() as i64, 3 * radius * (radius + 1) + 1);
        }
    }

    #[test]
    fn hex_disc_contains_origin_and_rim() {
        let grid = Grid::hex_disc(2);
        assert!(grid.contains(Coord::new(0, 0)));
        assert!(grid.contains(Coord::new(2, 0)));
        assert!(grid.contains(Coord::new(2, -2)));
        assert!(!grid.contains(Coord::new(2, 1)));
    }
}
