use std::collections::VecDeque;

use serde::Serialize;

use crate::config::TrailConfig;
use crate::error::{Error, Result};
use crate::utils;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrailSummary {
    // NOTE: plain arithmetic mean, so it is meaningless for a trail crossing
    // the antimeridian. Fine for the region we serve.
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub total_distance: f64,
    pub elevation_gain: f64,
}

impl TrailSummary {
    /// Trail length as stored on the trail entity (whole meters, truncated).
    pub fn length_meters(&self) -> u32 {
        self.total_distance as u32
    }

    pub fn elevation_gain_meters(&self) -> u32 {
        self.elevation_gain as u32
    }
}

/// Elevation gain over a sliding window of altitudes.
///
/// Raw GPS altitude jumps around by several meters between samples, summing
/// positive deltas wildly overestimates the climb. Instead we compare window
/// averages against a reference average and only commit a change once it
/// exceeds the threshold. Sub-threshold changes leave the reference untouched.
pub struct ElevationGain {
    window: VecDeque<f64>,
    window_size: usize,
    threshold: f64,
    reference_avg: Option<f64>,
    gain: f64,
}

impl ElevationGain {
    pub fn new(config: &TrailConfig) -> Self {
        ElevationGain {
            window: VecDeque::with_capacity(config.altitude_compare_points + 1),
            window_size: config.altitude_compare_points,
            threshold: config.height_threshold,
            reference_avg: None,
            gain: 0.0,
        }
    }

    pub fn push(&mut self, altitude: f64) {
        self.window.push_back(altitude);
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }

        // only trust the average once the window is more than half full
        if self.window.len() * 2 <= self.window_size {
            return;
        }
        let current_avg = self.window.iter().sum::<f64>() / self.window.len() as f64;

        match self.reference_avg {
            None => self.reference_avg = Some(current_avg),
            Some(reference_avg) => {
                let delta = current_avg - reference_avg;
                if delta.abs() > self.threshold {
                    if delta > 0.0 {
                        self.gain += delta;
                    }
                    self.reference_avg = Some(current_avg);
                }
            }
        }
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }
}

/// Folds track points (in recorded order) into a `TrailSummary`.
pub struct TrailAnalyzer {
    count: usize,
    latitude_sum: f64,
    longitude_sum: f64,
    total_distance: f64,
    last_point: Option<GeoPoint>,
    elevation_gain: ElevationGain,
}

impl TrailAnalyzer {
    pub fn new(config: &TrailConfig) -> Self {
        TrailAnalyzer {
            count: 0,
            latitude_sum: 0.0,
            longitude_sum: 0.0,
            total_distance: 0.0,
            last_point: None,
            elevation_gain: ElevationGain::new(config),
        }
    }

    pub fn push(&mut self, point: GeoPoint) {
        self.count += 1;
        self.latitude_sum += point.latitude;
        self.longitude_sum += point.longitude;
        if let Some(last_point) = &self.last_point {
            self.total_distance += utils::haversine_distance(
                last_point.latitude,
                last_point.longitude,
                point.latitude,
                point.longitude,
            );
        }
        self.elevation_gain.push(point.altitude);
        self.last_point = Some(point);
    }

    pub fn finish(self) -> Result<TrailSummary> {
        if self.count == 0 {
            return Err(Error::EmptyInput);
        }
        let count = self.count as f64;
        Ok(TrailSummary {
            center_latitude: self.latitude_sum / count,
            center_longitude: self.longitude_sum / count,
            total_distance: self.total_distance,
            elevation_gain: self.elevation_gain.gain(),
        })
    }
}

pub fn analyze<I>(points: I, config: &TrailConfig) -> Result<TrailSummary>
where
    I: IntoIterator<Item = Result<GeoPoint>>,
{
    let mut analyzer = TrailAnalyzer::new(config);
    for point in points {
        analyzer.push(point?);
    }
    analyzer.finish()
}
