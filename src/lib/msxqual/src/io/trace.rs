//! Binary hydraulic trace reader and the `HydraulicSource` seam
//! the router drives its steps from. `VecHydraulicSource` is the in-memory
//! counterpart used by scenario tests; it is not a stub of the binary
//! reader, it is the first-class way tests supply hydraulics.

use crate::error::MsxError;
use crate::model::flow_direction;
use std::io::Read;

pub const HYDRAULIC_TRACE_MAGIC: i32 = 516114521;

#[derive(Debug, Clone)]
pub struct HydraulicEvent {
    pub time: i32,
    pub demand: Vec<f32>,
    pub head: Vec<f32>,
    pub flow: Vec<f32>,
    pub status: Vec<f32>,
    pub time_step: i32,
}

pub trait HydraulicSource {
    fn n_nodes(&self) -> usize;
    fn n_links(&self) -> usize;
    /// Returns the next event, or `None` once the trace is exhausted.
    fn next_event(&mut self) -> Result<Option<HydraulicEvent>, MsxError>;
}

fn read_i32(r: &mut impl Read) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32_vec(r: &mut impl Read, n: usize) -> std::io::Result<Vec<f32>> {
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; 4];
    for _ in 0..n {
        r.read_exact(&mut buf)?;
        out.push(f32::from_le_bytes(buf));
    }
    Ok(out)
}

#[derive(Debug)]
pub struct BinaryHydraulicTrace<R: Read> {
    reader: R,
    n_nodes: usize,
    n_links: usize,
    version: i32,
}

impl<R: Read> BinaryHydraulicTrace<R> {
    pub fn open(mut reader: R) -> Result<Self, MsxError> {
        let magic = read_i32(&mut reader).map_err(|e| MsxError::Io(e.to_string()))?;
        if magic != HYDRAULIC_TRACE_MAGIC {
            return Err(MsxError::Io(format!("bad hydraulic trace magic number {magic}")));
        }
        let version = read_i32(&mut reader).map_err(|e| MsxError::Io(e.to_string()))?;
        let n_nodes = read_i32(&mut reader).map_err(|e| MsxError::Io(e.to_string()))? as usize;
        let n_links = read_i32(&mut reader).map_err(|e| MsxError::Io(e.to_string()))? as usize;
        for _ in 0..3 {
            read_i32(&mut reader).map_err(|e| MsxError::Io(e.to_string()))?;
        }
        Ok(BinaryHydraulicTrace {
            reader,
            n_nodes,
            n_links,
            version,
        })
    }

    pub fn version(&self) -> i32 {
        self.version
    }
}

impl<R: Read> HydraulicSource for BinaryHydraulicTrace<R> {
    fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    fn n_links(&self) -> usize {
        self.n_links
    }

    fn next_event(&mut self) -> Result<Option<HydraulicEvent>, MsxError> {
        let time = match read_i32(&mut self.reader) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(MsxError::Io(e.to_string())),
        };
        let io = |e: std::io::Error| MsxError::Io(e.to_string());
        let demand = read_f32_vec(&mut self.reader, self.n_nodes).map_err(io)?;
        let head = read_f32_vec(&mut self.reader, self.n_nodes).map_err(io)?;
        let mut flow = read_f32_vec(&mut self.reader, self.n_links).map_err(io)?;
        let status = read_f32_vec(&mut self.reader, self.n_links).map_err(io)?;
        let _settings = read_f32_vec(&mut self.reader, self.n_links).map_err(io)?;
        let time_step = read_i32(&mut self.reader).map_err(io)?;

        for q in flow.iter_mut() {
            if flow_direction(*q as f64) == crate::model::FlowDirection::Zero {
                *q = 0.0;
            }
        }

        Ok(Some(HydraulicEvent {
            time,
            demand,
            head,
            flow,
            status,
            time_step,
        }))
    }
}

/// In-memory hydraulic source for tests: a prerecorded event list replayed
/// in order.
pub struct VecHydraulicSource {
    n_nodes: usize,
    n_links: usize,
    events: std::collections::VecDeque<HydraulicEvent>,
}

impl VecHydraulicSource {
    pub fn new(n_nodes: usize, n_links: usize, events: Vec<HydraulicEvent>) -> Self {
        VecHydraulicSource {
            n_nodes,
            n_links,
            events: events.into(),
        }
    }
}

impl HydraulicSource for VecHydraulicSource {
    fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    fn n_links(&self) -> usize {
        self.n_links
    }

    fn next_event(&mut self) -> Result<Option<HydraulicEvent>, MsxError> {
        Ok(self.events.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&HYDRAULIC_TRACE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&1i32.to_le_bytes()); // version
        buf.extend_from_slice(&2i32.to_le_bytes()); // n_nodes
        buf.extend_from_slice(&1i32.to_le_bytes()); // n_links
        for _ in 0..3 {
            buf.extend_from_slice(&0i32.to_le_bytes());
        }
        // one event
        buf.extend_from_slice(&0i32.to_le_bytes()); // time
        buf.extend_from_slice(&1.0f32.to_le_bytes()); // demand[0]
        buf.extend_from_slice(&2.0f32.to_le_bytes()); // demand[1]
        buf.extend_from_slice(&10.0f32.to_le_bytes()); // head[0]
        buf.extend_from_slice(&20.0f32.to_le_bytes()); // head[1]
        buf.extend_from_slice(&0.5f32.to_le_bytes()); // flow[0]
        buf.extend_from_slice(&1.0f32.to_le_bytes()); // status[0]
        buf.extend_from_slice(&0.0f32.to_le_bytes()); // settings[0]
        buf.extend_from_slice(&300i32.to_le_bytes()); // timeStep
        buf
    }

    #[test]
    fn reads_header_and_single_event() {
        let bytes = sample_bytes();
        let mut trace = BinaryHydraulicTrace::open(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(trace.n_nodes(), 2);
        assert_eq!(trace.n_links(), 1);
        let ev = trace.next_event().unwrap().unwrap();
        assert_eq!(ev.time, 0);
        assert_eq!(ev.time_step, 300);
        assert!((ev.flow[0] - 0.5).abs() < 1e-6);
        assert!(trace.next_event().unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_bytes();
        bytes[0] = 0;
        let err = BinaryHydraulicTrace::open(std::io::Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.error_code(), 2);
    }
}
