//! Well-known-text geometries.
//!
//! Geometries are kept as a small coordinate tree so that they can be
//! compared, re-serialized and reduced from three to two dimensions without a
//! spatial library. Both ISO WKT (`POINT Z (1 2 3)`) and PostGIS EWKT
//! (`SRID=4326;POINT(1 2 3)`) are accepted; output is ISO WKT with an optional
//! `SRID=` prefix.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const GEOMETRY_TYPES: &[&str] = &[
    "POINT",
    "LINESTRING",
    "POLYGON",
    "MULTIPOINT",
    "MULTILINESTRING",
    "MULTIPOLYGON",
    "GEOMETRYCOLLECTION",
    "CIRCULARSTRING",
    "COMPOUNDCURVE",
    "CURVEPOLYGON",
    "MULTICURVE",
    "MULTISURFACE",
    "POLYHEDRALSURFACE",
    "TRIANGLE",
    "TIN",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("invalid WKT: {0}")]
    InvalidWkt(String),
    #[error("invalid GeoJSON geometry: {0}")]
    InvalidGeoJson(String),
}

/// Coordinate dimensions of a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimensions {
    Xy,
    Xyz,
    Xym,
    Xyzm,
}

impl Dimensions {
    fn from_len(len: usize) -> Self {
        match len {
            0..=2 => Dimensions::Xy,
            3 => Dimensions::Xyz,
            _ => Dimensions::Xyzm,
        }
    }

    fn marker(self) -> &'static str {
        match self {
            Dimensions::Xy => "",
            Dimensions::Xyz => " Z",
            Dimensions::Xym => " M",
            Dimensions::Xyzm => " ZM",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Empty,
    Coord(Vec<f64>),
    List(Vec<Node>),
    Geometry(Box<Geometry>),
}

impl Node {
    fn first_coord_len(&self) -> Option<usize> {
        match self {
            Node::Empty => None,
            Node::Coord(c) => Some(c.len()),
            Node::List(items) => items.iter().find_map(Node::first_coord_len),
            Node::Geometry(_) => None,
        }
    }

    fn truncated(&self, len: usize) -> Node {
        match self {
            Node::Empty => Node::Empty,
            Node::Coord(c) => Node::Coord(c.iter().copied().take(len).collect()),
            Node::List(items) => Node::List(items.iter().map(|n| n.truncated(len)).collect()),
            Node::Geometry(g) => Node::Geometry(Box::new(g.to_2d())),
        }
    }

    fn write(&self, out: &mut String) {
        match self {
            Node::Empty => out.push_str("EMPTY"),
            Node::Coord(c) => {
                let parts: Vec<String> = c.iter().map(|v| v.to_string()).collect();
                out.push_str(&parts.join(" "));
            }
            Node::List(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write(out);
                }
                out.push(')');
            }
            Node::Geometry(g) => g.write_untagged(out),
        }
    }
}

/// A parsed geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    srid: Option<i32>,
    kind: String,
    dims: Dimensions,
    body: Node,
}

impl Geometry {
    /// Parse WKT or EWKT text.
    pub fn from_wkt(text: &str) -> Result<Self, GeometryError> {
        let text = text.trim();
        let (srid, rest) = split_srid(text)?;
        let tokens = tokenize(rest)?;
        let mut parser = WktParser { tokens, pos: 0 };
        let mut geometry = parser.parse_geometry()?;
        if parser.pos != parser.tokens.len() {
            return Err(GeometryError::InvalidWkt(format!(
                "unexpected trailing input in '{}'",
                text
            )));
        }
        geometry.srid = srid;
        Ok(geometry)
    }

    /// Convert a GeoJSON geometry object.
    pub fn from_geojson(value: &serde_json::Value) -> Result<Self, GeometryError> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| GeometryError::InvalidGeoJson("missing 'type'".to_string()))?;

        if kind == "GeometryCollection" {
            let members = value
                .get("geometries")
                .and_then(|g| g.as_array())
                .ok_or_else(|| GeometryError::InvalidGeoJson("missing 'geometries'".to_string()))?;
            let children = members
                .iter()
                .map(|m| Geometry::from_geojson(m).map(|g| Node::Geometry(Box::new(g))))
                .collect::<Result<Vec<_>, _>>()?;
            let dims = children
                .iter()
                .find_map(|c| match c {
                    Node::Geometry(g) => Some(g.dims),
                    _ => None,
                })
                .unwrap_or(Dimensions::Xy);
            let body = if children.is_empty() { Node::Empty } else { Node::List(children) };
            return Ok(Geometry {
                srid: None,
                kind: "GEOMETRYCOLLECTION".to_string(),
                dims,
                body,
            });
        }

        let coordinates = value
            .get("coordinates")
            .ok_or_else(|| GeometryError::InvalidGeoJson("missing 'coordinates'".to_string()))?;

        let (wkt_kind, depth) = match kind {
            "Point" => ("POINT", 0),
            "LineString" => ("LINESTRING", 1),
            "Polygon" => ("POLYGON", 2),
            "MultiPoint" => ("MULTIPOINT", 1),
            "MultiLineString" => ("MULTILINESTRING", 2),
            "MultiPolygon" => ("MULTIPOLYGON", 3),
            other => {
                return Err(GeometryError::InvalidGeoJson(format!(
                    "unsupported geometry type '{}'",
                    other
                )))
            }
        };

        let body = if coordinates.as_array().map_or(false, |a| a.is_empty()) {
            Node::Empty
        } else {
            let nested = json_coordinates(coordinates, depth)?;
            match (wkt_kind, nested) {
                ("POINT", coord) => Node::List(vec![coord]),
                // MULTIPOINT ((1 2), (3 4))
                ("MULTIPOINT", Node::List(points)) => Node::List(
                    points.into_iter().map(|p| Node::List(vec![p])).collect(),
                ),
                (_, node) => node,
            }
        };
        let dims = Dimensions::from_len(body.first_coord_len().unwrap_or(2));

        Ok(Geometry {
            srid: None,
            kind: wkt_kind.to_string(),
            dims,
            body,
        })
    }

    pub fn srid(&self) -> Option<i32> {
        self.srid
    }

    pub fn with_srid(mut self, srid: Option<i32>) -> Self {
        self.srid = srid;
        self
    }

    /// Upper-case WKT type name, e.g. `POINT`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dims
    }

    pub fn has_z(&self) -> bool {
        matches!(self.dims, Dimensions::Xyz | Dimensions::Xyzm)
    }

    /// Copy of this geometry with every coordinate reduced to X and Y.
    pub fn to_2d(&self) -> Geometry {
        Geometry {
            srid: self.srid,
            kind: self.kind.clone(),
            dims: Dimensions::Xy,
            body: self.body.truncated(2),
        }
    }

    pub fn to_wkt(&self) -> String {
        let mut out = String::new();
        if let Some(srid) = self.srid {
            out.push_str(&format!("SRID={};", srid));
        }
        self.write_untagged(&mut out);
        out
    }

    fn write_untagged(&self, out: &mut String) {
        out.push_str(&self.kind);
        out.push_str(self.dims.marker());
        out.push(' ');
        self.body.write(out);
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wkt())
    }
}

impl FromStr for Geometry {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Geometry::from_wkt(s)
    }
}

impl Serialize for Geometry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wkt())
    }
}

fn split_srid(text: &str) -> Result<(Option<i32>, &str), GeometryError> {
    if !text.get(..5).map_or(false, |p| p.eq_ignore_ascii_case("SRID=")) {
        return Ok((None, text));
    }
    let (prefix, rest) = text
        .split_once(';')
        .ok_or_else(|| GeometryError::InvalidWkt(format!("SRID prefix without ';' in '{}'", text)))?;
    let srid = prefix[5..]
        .trim()
        .parse::<i32>()
        .map_err(|e| GeometryError::InvalidWkt(format!("invalid SRID '{}': {}", &prefix[5..], e)))?;
    Ok((Some(srid), rest))
}

fn json_coordinates(value: &serde_json::Value, depth: usize) -> Result<Node, GeometryError> {
    let items = value
        .as_array()
        .ok_or_else(|| GeometryError::InvalidGeoJson(format!("expected array, got {}", value)))?;
    if depth == 0 {
        let coord = items
            .iter()
            .map(|n| {
                n.as_f64()
                    .ok_or_else(|| GeometryError::InvalidGeoJson(format!("invalid ordinate {}", n)))
            })
            .collect::<Result<Vec<f64>, _>>()?;
        if coord.len() < 2 {
            return Err(GeometryError::InvalidGeoJson(
                "position needs at least two ordinates".to_string(),
            ));
        }
        return Ok(Node::Coord(coord));
    }
    let children = items
        .iter()
        .map(|item| json_coordinates(item, depth - 1))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Node::List(children))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(f64),
    Open,
    Close,
    Comma,
}

fn tokenize(text: &str) -> Result<Vec<Token>, GeometryError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || matches!(chars[i], '-' | '+' | '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| GeometryError::InvalidWkt(format!("invalid number '{}'", literal)))?;
                tokens.push(Token::Number(number));
            }
            other => {
                return Err(GeometryError::InvalidWkt(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

struct WktParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl WktParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_geometry(&mut self) -> Result<Geometry, GeometryError> {
        let word = match self.next() {
            Some(Token::Word(w)) => w,
            other => {
                return Err(GeometryError::InvalidWkt(format!(
                    "expected geometry type, found {:?}",
                    other
                )))
            }
        };

        // EWKT spells measured geometries as POINTM, LINESTRINGM, ...
        let (kind, mut dims) = if GEOMETRY_TYPES.contains(&word.as_str()) {
            (word, None)
        } else if let Some(base) = word.strip_suffix('M').filter(|b| GEOMETRY_TYPES.contains(b)) {
            (base.to_string(), Some(Dimensions::Xym))
        } else {
            return Err(GeometryError::InvalidWkt(format!("unknown geometry type '{}'", word)));
        };

        if let Some(Token::Word(marker)) = self.peek() {
            let marked = match marker.as_str() {
                "Z" => Some(Dimensions::Xyz),
                "M" => Some(Dimensions::Xym),
                "ZM" => Some(Dimensions::Xyzm),
                _ => None,
            };
            if marked.is_some() {
                dims = marked;
                self.pos += 1;
            }
        }

        let body = match self.peek() {
            Some(Token::Word(w)) if w == "EMPTY" => {
                self.pos += 1;
                Node::Empty
            }
            Some(Token::Open) => self.parse_list()?,
            other => {
                return Err(GeometryError::InvalidWkt(format!(
                    "expected '(' or EMPTY after {}, found {:?}",
                    kind, other
                )))
            }
        };

        let dims = dims.unwrap_or_else(|| Dimensions::from_len(body.first_coord_len().unwrap_or(2)));
        Ok(Geometry {
            srid: None,
            kind,
            dims,
            body,
        })
    }

    fn parse_list(&mut self) -> Result<Node, GeometryError> {
        match self.next() {
            Some(Token::Open) => {}
            other => {
                return Err(GeometryError::InvalidWkt(format!("expected '(', found {:?}", other)))
            }
        }

        let mut items = Vec::new();
        loop {
            let item = match self.peek() {
                Some(Token::Open) => self.parse_list()?,
                Some(Token::Word(w)) if w == "EMPTY" => {
                    self.pos += 1;
                    Node::Empty
                }
                Some(Token::Word(_)) => Node::Geometry(Box::new(self.parse_geometry()?)),
                Some(Token::Number(_)) => self.parse_coord()?,
                other => {
                    return Err(GeometryError::InvalidWkt(format!(
                        "unexpected token {:?}",
                        other
                    )))
                }
            };
            items.push(item);

            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::Close) => break,
                other => {
                    return Err(GeometryError::InvalidWkt(format!(
                        "expected ',' or ')', found {:?}",
                        other
                    )))
                }
            }
        }

        Ok(Node::List(items))
    }

    fn parse_coord(&mut self) -> Result<Node, GeometryError> {
        let mut ordinates = Vec::new();
        while let Some(Token::Number(n)) = self.peek() {
            ordinates.push(*n);
            self.pos += 1;
        }
        if ordinates.len() < 2 {
            return Err(GeometryError::InvalidWkt(
                "coordinate needs at least two ordinates".to_string(),
            ));
        }
        Ok(Node::Coord(ordinates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_point() {
        let g = Geometry::from_wkt("POINT (1 2)").unwrap();
        assert_eq!(g.kind(), "POINT");
        assert!(!g.has_z());
        assert_eq!(g.to_wkt(), "POINT (1 2)");
    }

    #[test]
    fn test_parse_ewkt_with_implicit_z() {
        let g = Geometry::from_wkt("SRID=4326;LINESTRING(1 2 3,4 5 6)").unwrap();
        assert_eq!(g.srid(), Some(4326));
        assert!(g.has_z());
        assert_eq!(g.to_wkt(), "SRID=4326;LINESTRING Z (1 2 3, 4 5 6)");
    }

    #[test]
    fn test_drop_z_dimension() {
        let g = Geometry::from_wkt("POLYGON Z ((0 0 1, 1 0 1, 1 1 1, 0 0 1))").unwrap();
        let flat = g.to_2d();
        assert!(!flat.has_z());
        assert_eq!(flat.to_wkt(), "POLYGON ((0 0, 1 0, 1 1, 0 0))");
    }

    #[test]
    fn test_measured_geometry_is_not_z() {
        let g = Geometry::from_wkt("POINTM(1 2 3)").unwrap();
        assert_eq!(g.dimensions(), Dimensions::Xym);
        assert!(!g.has_z());
    }

    #[test]
    fn test_geometry_collection() {
        let g = Geometry::from_wkt("GEOMETRYCOLLECTION (POINT (1 2), LINESTRING (0 0, 1 1))").unwrap();
        assert_eq!(g.to_wkt(), "GEOMETRYCOLLECTION (POINT (1 2), LINESTRING (0 0, 1 1))");
    }

    #[test]
    fn test_empty_geometry() {
        let g = Geometry::from_wkt("point empty").unwrap();
        assert_eq!(g.to_wkt(), "POINT EMPTY");
    }

    #[test]
    fn test_invalid_wkt() {
        assert!(Geometry::from_wkt("POINT (1)").is_err());
        assert!(Geometry::from_wkt("CIRCLE (1 2)").is_err());
        assert!(Geometry::from_wkt("POINT (1 2").is_err());
        assert!(Geometry::from_wkt("POINT (1 2) extra").is_err());
    }

    #[test]
    fn test_from_geojson() {
        let g = Geometry::from_geojson(&json!({
            "type": "MultiPoint",
            "coordinates": [[1.0, 2.0], [3.5, 4.0]]
        }))
        .unwrap();
        assert_eq!(g.to_wkt(), "MULTIPOINT ((1 2), (3.5 4))");

        let g = Geometry::from_geojson(&json!({
            "type": "Point",
            "coordinates": [1.0, 2.0, 3.0]
        }))
        .unwrap();
        assert!(g.has_z());
        assert_eq!(g.to_2d().to_wkt(), "POINT (1 2)");
    }

    #[test]
    fn test_geojson_roundtrips_through_wkt() {
        let g = Geometry::from_geojson(&json!({
            "type": "Polygon",
            "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]]
        }))
        .unwrap();
        let reparsed = Geometry::from_wkt(&g.to_wkt()).unwrap();
        assert_eq!(g, reparsed);
    }
}
