//! `[OPTIONS]`-derived configuration. The INP-style text lexer
//! that produces these values is out of scope; this struct is the
//! narrow interface a caller's own parser (or a hand-built test fixture)
//! populates. It derives `serde` so a caller may also load it from any
//! structured format (JSON, etc.) without the core depending on one.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AreaUnits {
    Ft2,
    M2,
    Cm2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateUnits {
    Sec,
    Min,
    Hr,
    Day,
}

impl RateUnits {
    /// Seconds per unit, used to convert `dt` into reaction-rate units.
    pub fn seconds_per_unit(self) -> f64 {
        match self {
            RateUnits::Sec => 1.0,
            RateUnits::Min => 60.0,
            RateUnits::Hr => 3600.0,
            RateUnits::Day => 86400.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverKind {
    Euler,
    Rk45,
    Rosenbrock2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coupling {
    None,
    Full,
}

/// `COMPILER` is accepted for input-format compatibility but always
/// behaves as `None`; native compilation is not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompilerKind {
    None,
    Vc,
    Gc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityOptions {
    pub area_units: AreaUnits,
    pub rate_units: RateUnits,
    pub solver: SolverKind,
    pub coupling: Coupling,
    /// Quality time step, held in milliseconds (default 300000, i.e. 5 minutes).
    pub qstep_ms: u64,
    pub rtol: f64,
    pub atol: f64,
    pub compiler: CompilerKind,
    pub max_segments: usize,
    pub peclet_limit: f64,
    pub maxit: usize,
    pub numsig: i32,
}

impl Default for QualityOptions {
    fn default() -> Self {
        QualityOptions {
            area_units: AreaUnits::Ft2,
            rate_units: RateUnits::Sec,
            solver: SolverKind::Rk45,
            coupling: Coupling::None,
            qstep_ms: 300_000,
            rtol: 1e-4,
            atol: 1e-4,
            compiler: CompilerKind::None,
            max_segments: crate::model::DEFAULT_MAX_SEGMENTS,
            peclet_limit: 1000.0,
            maxit: 20,
            numsig: 3,
        }
    }
}

impl QualityOptions {
    /// Clamp `max_segments` to the configured floor (`SEGMENTS` min 50).
    pub fn normalized(mut self) -> Self {
        if self.max_segments < crate::model::MIN_MAX_SEGMENTS {
            self.max_segments = crate::model::MIN_MAX_SEGMENTS;
        }
        self
    }
}
