//! Binary output writer and the `QualitySink` seam the router's
//! caller reports through once per reporting period.

use crate::error::MsxError;
use crate::model::Species;
use std::io::Write;

pub const OUTPUT_MAGIC: i32 = 516114521;
const UNITS_FIELD_LEN: usize = 16;

pub trait QualitySink {
    /// `node_c`/`link_c` are species-major: all nodes for species 0, then
    /// all nodes for species 1, and so on (ditto for links).
    fn write_period(&mut self, node_c: &[f32], link_c: &[f32]) -> Result<(), MsxError>;
}

pub struct BinaryOutputWriter<W: Write> {
    writer: W,
    n_nodes: usize,
    n_links: usize,
    n_species: usize,
    periods: i32,
    bytes_written: i32,
    results_offset: i32,
}

fn write_i32(w: &mut impl Write, v: i32) -> Result<(), MsxError> {
    w.write_all(&v.to_le_bytes()).map_err(|e| MsxError::Io(e.to_string()))
}

fn write_f32(w: &mut impl Write, v: f32) -> Result<(), MsxError> {
    w.write_all(&v.to_le_bytes()).map_err(|e| MsxError::Io(e.to_string()))
}

fn padded_units(units: &str) -> [u8; UNITS_FIELD_LEN] {
    let mut buf = [0u8; UNITS_FIELD_LEN];
    let bytes = units.as_bytes();
    let n = bytes.len().min(UNITS_FIELD_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

impl<W: Write> BinaryOutputWriter<W> {
    pub fn open(
        mut writer: W,
        n_nodes: usize,
        n_links: usize,
        species: &[Species],
        reporting_step_seconds: i32,
    ) -> Result<Self, MsxError> {
        write_i32(&mut writer, OUTPUT_MAGIC)?;
        write_i32(&mut writer, 1)?; // version
        write_i32(&mut writer, n_nodes as i32)?;
        write_i32(&mut writer, n_links as i32)?;
        write_i32(&mut writer, species.len() as i32)?;
        write_i32(&mut writer, reporting_step_seconds)?;
        let mut header_bytes = 24i32;
        for sp in species {
            write_i32(&mut writer, sp.name.len() as i32)?;
            writer.write_all(sp.name.as_bytes()).map_err(|e| MsxError::Io(e.to_string()))?;
            writer
                .write_all(&padded_units(&sp.units))
                .map_err(|e| MsxError::Io(e.to_string()))?;
            header_bytes += 4 + sp.name.len() as i32 + UNITS_FIELD_LEN as i32;
        }
        Ok(BinaryOutputWriter {
            writer,
            n_nodes,
            n_links,
            n_species: species.len(),
            periods: 0,
            bytes_written: header_bytes,
            results_offset: header_bytes,
        })
    }

    pub fn finalize(mut self, error_code: i32) -> Result<(), MsxError> {
        write_i32(&mut self.writer, self.results_offset)?;
        write_i32(&mut self.writer, self.periods)?;
        write_i32(&mut self.writer, error_code)?;
        write_i32(&mut self.writer, OUTPUT_MAGIC)?;
        Ok(())
    }
}

impl<W: Write> QualitySink for BinaryOutputWriter<W> {
    fn write_period(&mut self, node_c: &[f32], link_c: &[f32]) -> Result<(), MsxError> {
        if node_c.len() != self.n_species * self.n_nodes || link_c.len() != self.n_species * self.n_links {
            return Err(MsxError::ApiMisuse(
                "write_period: concentration array length does not match nSpecies * nNodes/nLinks".to_string(),
            ));
        }
        for &v in node_c {
            write_f32(&mut self.writer, v)?;
        }
        for &v in link_c {
            write_f32(&mut self.writer, v)?;
        }
        self.bytes_written += 4 * (node_c.len() + link_c.len()) as i32;
        self.periods += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SpeciesExpr, SpeciesType};

    fn one_species() -> Vec<Species> {
        vec![Species {
            name: "CL".into(),
            kind: SpeciesType::Bulk,
            units: "MG/L".into(),
            atol: 1e-6,
            rtol: 1e-6,
            report_precision: 2,
            pipe_expr: SpeciesExpr::none(),
            tank_expr: SpeciesExpr::none(),
        }]
    }

    #[test]
    fn writes_header_periods_and_trailer() {
        let species = one_species();
        let buf: Vec<u8> = Vec::new();
        let mut writer = BinaryOutputWriter::open(buf, 2, 1, &species, 3600).unwrap();
        writer.write_period(&[1.0, 2.0], &[3.0]).unwrap();
        writer.write_period(&[1.5, 2.5], &[3.5]).unwrap();
        let periods = writer.periods;
        writer.finalize(0).unwrap();
        assert_eq!(periods, 2);
    }

    #[test]
    fn rejects_mismatched_period_length() {
        let species = one_species();
        let buf: Vec<u8> = Vec::new();
        let mut writer = BinaryOutputWriter::open(buf, 2, 1, &species, 3600).unwrap();
        let err = writer.write_period(&[1.0], &[3.0]).unwrap_err();
        assert_eq!(err.error_code(), 5);
    }
}
