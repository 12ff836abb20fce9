//! Scan summarization.
//!
//! Pure, synchronous derivation of the renderer payload from a raw scan.
//! Computed fresh per delivery; nothing here holds state.

use crate::core::{Peak, ScanEvent, ScanSummary};
use crate::error::{AppResult, BridgeError};
use std::cmp::Ordering;

/// Number of peaks retained in the summary annotation.
pub const TOP_K: usize = 5;

/// Derive a [`ScanSummary`] from a scan.
///
/// Validates the paired-array invariant and fails with
/// [`BridgeError::MalformedScan`] on mismatched lengths. An empty scan is
/// valid: zero peaks, zero TIC, no base peak.
///
/// Top peaks are ordered by intensity descending with ascending-mass
/// tie-break for equal intensities.
pub fn summarize(scan: &ScanEvent) -> AppResult<ScanSummary> {
    if scan.masses.len() != scan.intensities.len() {
        return Err(BridgeError::MalformedScan {
            masses: scan.masses.len(),
            intensities: scan.intensities.len(),
        });
    }

    let mut peaks: Vec<Peak> = scan
        .masses
        .iter()
        .zip(scan.intensities.iter())
        .map(|(&mass, &intensity)| Peak { mass, intensity })
        .collect();
    peaks.sort_by(|a, b| {
        b.intensity
            .partial_cmp(&a.intensity)
            .unwrap_or(Ordering::Equal)
            .then(a.mass.partial_cmp(&b.mass).unwrap_or(Ordering::Equal))
    });
    peaks.truncate(TOP_K);

    let tic: f64 = scan.intensities.iter().sum();

    Ok(ScanSummary {
        scan_number: scan.scan_number,
        timestamp: scan.timestamp,
        masses: scan.masses.clone(),
        intensities: scan.intensities.clone(),
        centroid_count: scan.centroid_count(),
        tic,
        base_peak: peaks.first().copied(),
        top_peaks: peaks,
    })
}
