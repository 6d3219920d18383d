use crate::config::TrailConfig;
use crate::error::{Error, Result};
use crate::trail_analyzer::{self, GeoPoint, TrailSummary};
use flate2::read::GzDecoder;
use std::{fs::File, io::BufReader, io::Read, path::Path};

const LATITUDE: &str = "Latitude";
const LONGITUDE: &str = "Longitude";
const ALTITUDE: &str = "Altitude";

struct Columns {
    latitude: usize,
    longitude: usize,
    altitude: usize,
}

impl Columns {
    // exported tracks put the columns in whatever order the device likes
    fn from_headers(headers: &csv::StringRecord) -> Result<Self> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|header| header.trim() == name)
                .ok_or_else(|| Error::MalformedInput(format!("missing column: {}", name)))
        };
        Ok(Columns {
            latitude: find(LATITUDE)?,
            longitude: find(LONGITUDE)?,
            altitude: find(ALTITUDE)?,
        })
    }

    fn parse(&self, record: &csv::StringRecord) -> Result<GeoPoint> {
        let line = record.position().map(|x| x.line()).unwrap_or_default();
        let field = |index: usize, name: &str| -> Result<f64> {
            let value = record.get(index).ok_or_else(|| {
                Error::MalformedInput(format!("line {}: missing value for {}", line, name))
            })?;
            value.trim().parse::<f64>().map_err(|e| {
                Error::MalformedInput(format!("line {}: invalid {} {:?}: {}", line, name, value, e))
            })
        };
        Ok(GeoPoint {
            latitude: field(self.latitude, LATITUDE)?,
            longitude: field(self.longitude, LONGITUDE)?,
            altitude: field(self.altitude, ALTITUDE)?,
        })
    }
}

fn csv_error(e: csv::Error) -> Error {
    Error::MalformedInput(e.to_string())
}

/// Reads `GeoPoint`s from an uncompressed CSV stream with a header row.
pub fn load_csv<R: Read>(reader: R) -> Result<impl Iterator<Item = Result<GeoPoint>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let columns = Columns::from_headers(reader.headers().map_err(csv_error)?)?;
    Ok(reader
        .into_records()
        .map(move |record| columns.parse(&record.map_err(csv_error)?)))
}

pub fn load_gzip_csv<R: Read>(reader: R) -> Result<impl Iterator<Item = Result<GeoPoint>>> {
    load_csv(GzDecoder::new(reader))
}

pub fn analyze_csv<R: Read>(reader: R, config: &TrailConfig) -> Result<TrailSummary> {
    trail_analyzer::analyze(load_csv(reader)?, config)
}

/// Analyzes an uploaded trail recording (gzip compressed CSV with
/// `Latitude`, `Longitude` and `Altitude` columns).
pub fn analyze_gzip_csv<R: Read>(reader: R, config: &TrailConfig) -> Result<TrailSummary> {
    trail_analyzer::analyze(load_gzip_csv(reader)?, config)
}

pub fn analyze_trail_file<P: AsRef<Path>>(file_path: P, config: &TrailConfig) -> Result<TrailSummary> {
    let file = File::open(file_path.as_ref()).map_err(|e| {
        Error::SourceUnavailable(format!("{:?}: {}", file_path.as_ref(), e))
    })?;
    analyze_gzip_csv(BufReader::new(file), config)
}
