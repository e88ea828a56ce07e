//! Diagnostic dumps of spectra and the accumulator, for development
//! only. One `(frequency, intensity)` pair per line, gnuplot-friendly.
//! Enabled by the `dump-spectra` feature; no stability contract.

use std::fs::{self, File};
use std::io::{BufWriter, Write};

use crate::math;
use crate::spectrum::Spectrum;

const DUMP_DIR: &str = "spectrum";

fn write_bins(path: &str, bins: &[f64]) -> std::io::Result<()> {
    fs::create_dir_all(DUMP_DIR)?;
    let mut file = BufWriter::new(File::create(path)?);
    for (m, y) in bins.iter().enumerate() {
        writeln!(file, "{} {}", math::mtof(m as f64), y)?;
    }
    Ok(())
}

/// Writes one key's spectrum to `spectrum/<k>-<label>.dat`.
pub fn dump_spectrum(key_index: usize, label: &str, spectrum: &Spectrum) -> std::io::Result<()> {
    write_bins(&format!("{DUMP_DIR}/{key_index}-{label}.dat"), spectrum.bins())
}

/// Writes the accumulator to `spectrum/0-accumulator.dat`.
pub fn dump_accumulator(bins: &[f64]) -> std::io::Result<()> {
    write_bins(&format!("{DUMP_DIR}/0-accumulator.dat"), bins)
}
