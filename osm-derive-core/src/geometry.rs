//! PostGIS extended well-known binary (EWKB) encoding.
//!
//! Points are emitted as fixed 25-byte records: a little-endian byte-order
//! tag, the geometry type with the SRID flag set, the SRID and the two
//! coordinates (1 + 4 + 4 + 8 + 8). Linestrings share the header and carry a point count.

use geo::{Coord, LineString};
use thiserror::Error;

const BYTE_ORDER_LITTLE_ENDIAN: u8 = 1;
const SRID_FLAG: u32 = 0x2000_0000;
const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;

/// Size of an encoded EWKB point.
pub const EWKB_POINT_LEN: usize = 25;

/// Equatorial radius used by the spherical mercator projection.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Spatial reference systems supported by the derived tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Srid {
    /// Longitude/latitude in degrees.
    #[default]
    Wgs84,
    /// Spherical (web) mercator in metres.
    WebMercator,
}

impl Srid {
    /// EPSG code written into encoded geometries.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Wgs84 => 4326,
            Self::WebMercator => 3857,
        }
    }

    /// Project a WGS84 coordinate into this reference system.
    #[must_use]
    pub fn project(self, coord: Coord<f64>) -> Coord<f64> {
        match self {
            Self::Wgs84 => coord,
            Self::WebMercator => lonlat_to_mercator(coord),
        }
    }
}

/// Errors raised when decoding EWKB.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    /// The buffer length does not match the geometry header.
    #[error("expected {expected} bytes of EWKB, found {found}")]
    Length {
        /// Length implied by the header.
        expected: usize,
        /// Length of the supplied buffer.
        found: usize,
    },
    /// The byte-order tag was not little endian.
    #[error("unsupported EWKB byte order tag {0}")]
    ByteOrder(u8),
    /// The geometry type was not the one requested.
    #[error("unexpected EWKB geometry type {0:#x}")]
    GeometryType(u32),
}

/// Project WGS84 degrees onto spherical mercator metres.
#[must_use]
pub fn lonlat_to_mercator(coord: Coord<f64>) -> Coord<f64> {
    let x = EARTH_RADIUS_M * coord.x.to_radians();
    let y = EARTH_RADIUS_M
        * (std::f64::consts::FRAC_PI_4 + coord.y.to_radians() / 2.0)
            .tan()
            .ln();
    Coord { x, y }
}

/// Encode a point with an embedded SRID.
///
/// # Examples
///
/// ```
/// use geo::Coord;
/// use osm_derive_core::geometry::{ewkb_point, EWKB_POINT_LEN};
///
/// let bytes = ewkb_point(Coord { x: 1.0, y: 2.0 }, 4326);
/// assert_eq!(bytes.len(), EWKB_POINT_LEN);
/// assert_eq!(bytes[0], 1);
/// ```
#[must_use]
pub fn ewkb_point(coord: Coord<f64>, srid: u32) -> [u8; EWKB_POINT_LEN] {
    let mut buffer = [0_u8; EWKB_POINT_LEN];
    let fields = std::iter::once(BYTE_ORDER_LITTLE_ENDIAN)
        .chain((WKB_POINT | SRID_FLAG).to_le_bytes())
        .chain(srid.to_le_bytes())
        .chain(coord.x.to_le_bytes())
        .chain(coord.y.to_le_bytes());
    for (slot, byte) in buffer.iter_mut().zip(fields) {
        *slot = byte;
    }
    buffer
}

/// Encode a linestring with an embedded SRID.
#[must_use]
pub fn ewkb_linestring(line: &LineString<f64>, srid: u32) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(13 + line.0.len() * 16);
    write_header(&mut encoded, WKB_LINESTRING, srid);
    let count = u32::try_from(line.0.len()).unwrap_or(u32::MAX);
    encoded.extend_from_slice(&count.to_le_bytes());
    for coord in line.coords() {
        write_coord(&mut encoded, *coord);
    }
    encoded
}

/// Decode an EWKB point produced by [`ewkb_point`], returning the coordinate
/// and SRID.
pub fn decode_ewkb_point(bytes: &[u8]) -> Result<(Coord<f64>, u32), GeometryError> {
    if bytes.len() != EWKB_POINT_LEN {
        return Err(GeometryError::Length {
            expected: EWKB_POINT_LEN,
            found: bytes.len(),
        });
    }
    let mut reader = Reader { bytes, offset: 0 };
    let tag = reader.byte();
    if tag != BYTE_ORDER_LITTLE_ENDIAN {
        return Err(GeometryError::ByteOrder(tag));
    }
    let geometry_type = reader.u32();
    if geometry_type != (WKB_POINT | SRID_FLAG) {
        return Err(GeometryError::GeometryType(geometry_type));
    }
    let srid = reader.u32();
    let x = reader.f64();
    let y = reader.f64();
    Ok((Coord { x, y }, srid))
}

/// Render bytes as lowercase hex, the text form PostGIS accepts.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn write_header(buffer: &mut Vec<u8>, geometry_type: u32, srid: u32) {
    buffer.push(BYTE_ORDER_LITTLE_ENDIAN);
    buffer.extend_from_slice(&(geometry_type | SRID_FLAG).to_le_bytes());
    buffer.extend_from_slice(&srid.to_le_bytes());
}

fn write_coord(buffer: &mut Vec<u8>, coord: Coord<f64>) {
    buffer.extend_from_slice(&coord.x.to_le_bytes());
    buffer.extend_from_slice(&coord.y.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0_u8; N];
        if let Some(slice) = self.bytes.get(self.offset..self.offset + N) {
            out.copy_from_slice(slice);
        }
        self.offset += N;
        out
    }

    fn byte(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.take())
    }
}
