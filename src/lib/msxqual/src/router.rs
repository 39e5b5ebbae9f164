//! Quality routing engine: the state machine that owns the
//! network's segment pool and chemistry engine and drives one quality
//! time step at a time -- topological node traversal, segment advection,
//! source injection, reaction, optional dispersion, and mass-balance
//! tallying.
//!
//! Mirrors EPANET-MSX's `msxqual.c` `transport`/`advectsegs`/`accumulate`
//! structure, adapted to the handle-based [`SegmentPool`] and to a
//! Kahn's-algorithm topological sweep in place of a sorted-by-flow-direction
//! node list.

use crate::chem::{ChemEngine, Domain};
use crate::dispersion::{disperse_tankqual, dispersion_pipe, reynolds_number, segqual_update, solve_nodequal};
use crate::error::{MathWarning, MsxError};
use crate::massbalance::MassBalance;
use crate::model::{FlowDirection, Link, MixModel, Node, Parameter, Pattern, SourceType, Species, Tank, Term, flow_direction};
use crate::options::QualityOptions;
use crate::segment::SegmentPool;
use crate::tanks::{fifo_tank, lifo_tank, mix1_tank, mix2_tank};
use std::collections::{HashMap, VecDeque};

/// Kinematic viscosity of water, ft^2/s, used for the Reynolds-number and
/// dispersion-coefficient estimates when no per-run value is supplied.
pub const DEFAULT_KINEMATIC_VISCOSITY: f64 = 1.22e-5;

pub struct Network {
    pub species: Vec<Species>,
    pub terms: Vec<Term>,
    pub parameters: Vec<Parameter>,
    pub constants: Vec<f64>,
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    pub tanks: Vec<Tank>,
    pub patterns: Vec<Pattern>,
    /// Per-species molecular diffusivity; a negative entry disables
    /// dispersion for that species. Kept alongside the
    /// network rather than on `Species` itself: it is a per-run transport
    /// parameter, not a reaction-kinetics one.
    pub molecular_diffusivities: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Idle,
    Opened,
    Initialized,
    Stepping,
    Finalized,
}

/// Diagnostics returned from a single [`QualRouter::step`] call.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub warnings: Vec<MathWarning>,
    pub reversed_links: Vec<usize>,
}

pub struct QualRouter {
    net: Network,
    pool: SegmentPool,
    chem: ChemEngine,
    mass_balance: MassBalance,
    options: QualityOptions,
    state: RouterState,
    interval: usize,
    kinematic_viscosity: f64,
}

fn node_pair(link: &Link) -> Option<(usize, usize)> {
    match link.flow_dir {
        FlowDirection::Positive => Some((link.n1, link.n2)),
        FlowDirection::Negative => Some((link.n2, link.n1)),
        FlowDirection::Zero => None,
    }
}

impl QualRouter {
    pub fn open(net: Network, options: QualityOptions) -> Result<Self, MsxError> {
        if net.molecular_diffusivities.len() != net.species.len() {
            return Err(MsxError::ApiMisuse(
                "molecular_diffusivities must have one entry per species".to_string(),
            ));
        }
        let n_species = net.species.len();
        let chem = ChemEngine::open(&net.species, &options);
        let pool = SegmentPool::new(n_species);
        let mass_balance = MassBalance::open(n_species);
        Ok(QualRouter {
            net,
            pool,
            chem,
            mass_balance,
            options,
            state: RouterState::Opened,
            interval: 0,
            kinematic_viscosity: DEFAULT_KINEMATIC_VISCOSITY,
        })
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn network(&self) -> &Network {
        &self.net
    }

    pub fn qstep_seconds(&self) -> f64 {
        self.options.qstep_ms as f64 / 1000.0
    }

    /// Concentration reported for a link: the segment at its downstream
    /// (head) end, the water about to cross into the next node. An empty
    /// link (no flow has occurred yet) reports its initial `c0`.
    pub fn link_concentration(&self, link_idx: usize) -> &[f64] {
        let link = &self.net.links[link_idx];
        if link.segments.head.is_none() {
            &link.c0
        } else {
            &self.pool.get(link.segments.head).c
        }
    }

    /// Seeds every link and tank with an initial segment from its
    /// `c0`/`c` field and records the system's initial mass per species.
    pub fn init(&mut self) -> Result<(), MsxError> {
        if self.state != RouterState::Opened {
            return Err(MsxError::ApiMisuse(
                "init() requires the router to be freshly opened".to_string(),
            ));
        }
        let n_species = self.net.species.len();

        for link in &mut self.net.links {
            let vol = link.volume();
            let h = self
                .pool
                .get_free_seg(vol, &link.c0)
                .ok_or_else(|| MsxError::Resource("segment pool exhausted during init".to_string()))?;
            self.pool.add_seg(&mut link.segments, h);
        }

        for tank in &mut self.net.tanks {
            if tank.is_reservoir() {
                continue;
            }
            match tank.mix_model {
                MixModel::Mix2 => {
                    let mix_vol = tank.initial_volume.min(tank.mixing_zone_volume.max(0.0));
                    let stag_vol = (tank.initial_volume - mix_vol).max(0.0);
                    let h1 = self
                        .pool
                        .get_free_seg(mix_vol, &tank.c)
                        .ok_or_else(|| MsxError::Resource("segment pool exhausted during init".to_string()))?;
                    self.pool.add_seg(&mut tank.segments, h1);
                    let h2 = self
                        .pool
                        .get_free_seg(stag_vol, &tank.c)
                        .ok_or_else(|| MsxError::Resource("segment pool exhausted during init".to_string()))?;
                    self.pool.add_seg(&mut tank.stagnant_segments, h2);
                }
                _ => {
                    let h = self
                        .pool
                        .get_free_seg(tank.initial_volume, &tank.c)
                        .ok_or_else(|| MsxError::Resource("segment pool exhausted during init".to_string()))?;
                    self.pool.add_seg(&mut tank.segments, h);
                }
            }
            tank.volume = tank.initial_volume;
        }

        let mut initial_mass = vec![0.0; n_species];
        for link in &self.net.links {
            for h in self.pool.iter_downstream(&link.segments) {
                let seg = self.pool.get(h);
                for i in 0..n_species {
                    initial_mass[i] += seg.volume * seg.c[i];
                }
            }
        }
        for tank in &self.net.tanks {
            for h in self.pool.iter_downstream(&tank.segments) {
                let seg = self.pool.get(h);
                for i in 0..n_species {
                    initial_mass[i] += seg.volume * seg.c[i];
                }
            }
            for h in self.pool.iter_downstream(&tank.stagnant_segments) {
                let seg = self.pool.get(h);
                for i in 0..n_species {
                    initial_mass[i] += seg.volume * seg.c[i];
                }
            }
        }
        self.mass_balance.set_initial(&initial_mass);
        self.state = RouterState::Initialized;
        Ok(())
    }

    /// Topological order of node indices, upstream before downstream,
    /// under the current flow directions. Falls back to forcing the
    /// lowest remaining node index through whenever a flow loop prevents
    /// Kahn's algorithm from making progress, trading strict
    /// upstream-before-downstream ordering within the loop for a run that
    /// completes instead of stalling.
    fn topological_order(&self) -> Vec<usize> {
        let n = self.net.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut out_edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        for link in &self.net.links {
            if let Some((up, down)) = node_pair(link) {
                in_degree[down] += 1;
                out_edges[up].push(down);
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&v| in_degree[v] == 0).collect();
        let mut remaining: Vec<bool> = vec![true; n];
        let mut order = Vec::with_capacity(n);

        while order.len() < n {
            if queue.is_empty() {
                let forced = (0..n).find(|&v| remaining[v]);
                match forced {
                    Some(v) => queue.push_back(v),
                    None => break,
                }
            }
            while let Some(v) = queue.pop_front() {
                if !remaining[v] {
                    continue;
                }
                remaining[v] = false;
                order.push(v);
                for &w in &out_edges[v] {
                    if remaining[w] {
                        in_degree[w] = in_degree[w].saturating_sub(1);
                        if in_degree[w] == 0 {
                            queue.push_back(w);
                        }
                    }
                }
            }
        }
        order
    }

    /// Advances the network by `dt_seconds`, given this step's per-link
    /// volumetric flow (signed; sign convention matches `link.n1 -> n2`).
    pub fn step(&mut self, flows: &[f64], dt_seconds: f64) -> Result<StepReport, MsxError> {
        let _span = tracing::info_span!("quality_step", interval = self.interval, dt_seconds).entered();
        if !matches!(self.state, RouterState::Initialized | RouterState::Stepping) {
            return Err(MsxError::ApiMisuse(
                "step() requires init() to have run first".to_string(),
            ));
        }
        if flows.len() != self.net.links.len() {
            return Err(MsxError::ApiMisuse("flows length must match link count".to_string()));
        }
        let n_species = self.net.species.len();
        let mut report = StepReport::default();

        for (i, link) in self.net.links.iter_mut().enumerate() {
            let new_dir = flow_direction(flows[i]);
            let reversed = matches!(
                (link.flow_dir, new_dir),
                (FlowDirection::Positive, FlowDirection::Negative) | (FlowDirection::Negative, FlowDirection::Positive)
            );
            link.flow_dir = new_dir;
            link.hyd_vars[1] = flows[i];
            let area = std::f64::consts::PI * link.diameter * link.diameter / 4.0;
            let velocity = if area > 0.0 { flows[i] / area } else { 0.0 };
            link.hyd_vars[0] = link.diameter;
            link.hyd_vars[2] = velocity;
            link.hyd_vars[3] = reynolds_number(velocity, link.diameter, self.kinematic_viscosity);
            link.hyd_vars[8] = link.length;
            if reversed {
                self.pool.reverse_segs(&mut link.segments);
                report.reversed_links.push(i);
            }
        }

        let topo = self.topological_order();
        let mut pending_inflow: HashMap<usize, Vec<(f64, Vec<f64>)>> = HashMap::new();
        let mut outgoing_volume: Vec<f64> = vec![0.0; self.net.nodes.len()];
        for link in &self.net.links {
            if let Some((up, _)) = node_pair(link) {
                outgoing_volume[up] += link.hyd_vars[1].abs() * dt_seconds;
            }
        }

        for &node_idx in &topo {
            let incoming = pending_inflow.remove(&node_idx).unwrap_or_default();
            let total_in_vol: f64 = incoming.iter().map(|(v, _)| *v).sum();
            let mut mixed_c = vec![0.0; n_species];
            if total_in_vol > 1e-12 {
                for (v, c) in &incoming {
                    for i in 0..n_species {
                        mixed_c[i] += c[i] * v;
                    }
                }
                for v in mixed_c.iter_mut() {
                    *v /= total_in_vol;
                }
            } else {
                mixed_c.clone_from(&self.net.nodes[node_idx].c);
            }

            if let Some(tank_idx) = self.net.nodes[node_idx].tank {
                let is_reservoir = self.net.tanks[tank_idx].is_reservoir();
                if is_reservoir {
                    self.tally_reservoir_discharge(&incoming);
                    let fixed_c = self.net.tanks[tank_idx].c.clone();
                    self.net.nodes[node_idx].c = fixed_c;
                } else {
                    let draw = outgoing_volume[node_idx].min(
                        total_in_vol + self.net.tanks[tank_idx].volume,
                    );
                    let mix_model = self.net.tanks[tank_idx].mix_model;
                    {
                        let tank = &mut self.net.tanks[tank_idx];
                        match mix_model {
                            MixModel::Mix1 => mix1_tank(&mut self.pool, tank, total_in_vol, &mixed_c, draw),
                            MixModel::Mix2 => mix2_tank(&mut self.pool, tank, total_in_vol, &mixed_c, draw),
                            MixModel::Fifo => fifo_tank(&mut self.pool, tank, total_in_vol, &mixed_c, draw),
                            MixModel::Lifo => lifo_tank(&mut self.pool, tank, total_in_vol, &mixed_c, draw),
                        }
                    }
                    let tank_c = self.net.tanks[tank_idx].c.clone();
                    self.net.nodes[node_idx].c = tank_c;
                }
            } else {
                self.apply_sources(node_idx, &mut mixed_c, dt_seconds, outgoing_volume[node_idx]);
                if total_in_vol > outgoing_volume[node_idx] + 1e-9 {
                    let excess = total_in_vol - outgoing_volume[node_idx];
                    for i in 0..n_species {
                        self.mass_balance.add_outflow(i, excess * mixed_c[i]);
                    }
                }
                self.net.nodes[node_idx].c = mixed_c;
            }

            let node_c = self.net.nodes[node_idx].c.clone();
            for link in &mut self.net.links {
                let Some((up, down)) = node_pair(link) else { continue };
                if up != node_idx {
                    continue;
                }
                let vol = link.hyd_vars[1].abs() * dt_seconds;
                if vol <= 1e-12 {
                    continue;
                }
                let h = match self.pool.get_free_seg(vol, &node_c) {
                    Some(h) => h,
                    None => {
                        tracing::error!(link_n1 = link.n1, link_n2 = link.n2, "segment pool exhausted during advection");
                        return Err(MsxError::Resource("segment pool exhausted during advection".to_string()));
                    }
                };
                self.pool.add_seg(&mut link.segments, h);

                let mut remaining = vol;
                let mut drained_mass = vec![0.0; n_species];
                while remaining > 1e-12 {
                    if link.segments.head.is_none() {
                        break;
                    }
                    let head = link.segments.head;
                    let seg_vol = self.pool.get(head).volume;
                    let take = seg_vol.min(remaining);
                    let c = self.pool.get(head).c.clone();
                    for i in 0..n_species {
                        drained_mass[i] += c[i] * take;
                    }
                    if take >= seg_vol - 1e-12 {
                        self.pool.remove_seg(&mut link.segments, head);
                        remaining -= seg_vol;
                    } else {
                        self.pool.get_mut(head).volume -= take;
                        remaining = 0.0;
                    }
                }
                let delivered = vol - remaining;
                let drained_c: Vec<f64> = if delivered > 1e-12 {
                    drained_mass.iter().map(|m| m / delivered).collect()
                } else {
                    vec![0.0; n_species]
                };
                pending_inflow.entry(down).or_default().push((delivered, drained_c));
            }
        }

        // reaction kinetics, per segment
        let dt_rate = dt_seconds / self.options.rate_units.seconds_per_unit();
        for link in &mut self.net.links {
            let handles: Vec<_> = self.pool.iter_downstream(&link.segments).collect();
            for h in handles {
                let seg = self.pool.get_mut(h);
                let before = seg.c.clone();
                let warning = self.chem.react_segment(
                    Domain::Pipe,
                    &mut seg.c,
                    dt_rate,
                    &self.net.species,
                    &self.net.terms,
                    &link.parameters,
                    &self.net.constants,
                    &link.hyd_vars,
                );
                if let Some(w) = warning {
                    if report.warnings.is_empty() {
                        tracing::warn!(object = %w.object, kind = w.expression_kind, "{}", w.message);
                    }
                    report.warnings.push(w);
                }
                let delta: Vec<f64> = seg.c.iter().zip(&before).map(|(a, b)| a - b).collect();
                let v = seg.volume;
                self.chem.accumulate_reacted_mass(&mut link.reacted, &self.net.species, &delta, v, link.diameter, 1.0, 1.0);
                for (i, d) in delta.iter().enumerate() {
                    self.mass_balance.add_reacted(i, d * v);
                }
            }
        }
        let hydraulic_zero = [0.0; 9];
        for tank in &mut self.net.tanks {
            if tank.is_reservoir() {
                continue;
            }
            for list in [&mut tank.segments, &mut tank.stagnant_segments] {
                let handles: Vec<_> = self.pool.iter_downstream(list).collect();
                for h in handles {
                    let seg = self.pool.get_mut(h);
                    let before = seg.c.clone();
                    let warning = self.chem.react_segment(
                        Domain::Tank,
                        &mut seg.c,
                        dt_rate,
                        &self.net.species,
                        &self.net.terms,
                        &tank.parameters,
                        &self.net.constants,
                        &hydraulic_zero,
                    );
                    if let Some(w) = warning {
                        report.warnings.push(w);
                    }
                    let delta: Vec<f64> = seg.c.iter().zip(&before).map(|(a, b)| a - b).collect();
                    let v = seg.volume;
                    self.chem.accumulate_reacted_mass(&mut tank.reacted, &self.net.species, &delta, v, 0.0, 1.0, 1.0);
                    for (i, d) in delta.iter().enumerate() {
                        self.mass_balance.add_reacted(i, d * v);
                    }
                }
            }
        }

        self.apply_dispersion(dt_seconds);

        self.interval += 1;
        self.state = RouterState::Stepping;
        Ok(report)
    }

    /// Network discharge arriving at a reservoir leaves the modeled system;
    /// tallied as outflow mass at the concentration it arrived with.
    fn tally_reservoir_discharge(&mut self, incoming: &[(f64, Vec<f64>)]) {
        let n_species = self.net.species.len();
        for (v, c) in incoming {
            for i in 0..n_species {
                self.mass_balance.add_outflow(i, c[i] * v);
            }
        }
    }

    fn apply_sources(&mut self, node_idx: usize, mixed_c: &mut [f64], dt_seconds: f64, outgoing_volume: f64) {
        let sources = self.net.nodes[node_idx].sources.clone();
        for src in &sources {
            let mult = match src.pattern {
                Some(p) => self
                    .net
                    .patterns
                    .get_mut(p)
                    .map(|pat| pat.value_at(self.interval))
                    .unwrap_or(1.0),
                None => 1.0,
            };
            let strength = src.base_strength * mult;
            let species = src.species;
            if species >= mixed_c.len() {
                continue;
            }
            match src.source_type {
                SourceType::Concen => {
                    mixed_c[species] = strength;
                }
                SourceType::Setpoint => {
                    mixed_c[species] = strength;
                }
                SourceType::Mass => {
                    if outgoing_volume > 1e-12 {
                        mixed_c[species] += strength * dt_seconds / outgoing_volume;
                    }
                }
                SourceType::FlowPaced => {
                    mixed_c[species] += strength;
                }
            }
            self.mass_balance.add_inflow(species, strength.max(0.0) * dt_seconds.max(0.0));
        }
    }

    /// Optional longitudinal-dispersion correction, applied
    /// once per species with a known (non-negative) molecular diffusivity.
    fn apply_dispersion(&mut self, dt_seconds: f64) {
        let peclet_limit = self.options.peclet_limit;
        let kinematic_viscosity = self.kinematic_viscosity;
        for species_idx in 0..self.net.species.len() {
            let diff = self.net.molecular_diffusivities[species_idx];
            if diff < 0.0 {
                continue;
            }
            let mut edges: Vec<(usize, usize, f64)> = Vec::new();
            let mut fixed: HashMap<usize, f64> = HashMap::new();
            for (i, node) in self.net.nodes.iter().enumerate() {
                if let Some(tank_idx) = node.tank {
                    fixed.insert(i, self.net.tanks[tank_idx].c[species_idx]);
                }
            }

            for link in &mut self.net.links {
                if link.flow_dir == FlowDirection::Zero {
                    continue;
                }
                dispersion_pipe(&mut self.pool, link, species_idx, diff, kinematic_viscosity, dt_seconds, peclet_limit);
                let area = std::f64::consts::PI * link.diameter * link.diameter / 4.0;
                let conductance = if link.length > 0.0 {
                    crate::dispersion::dispersion_coefficient(
                        link.hyd_vars[2],
                        link.diameter,
                        diff,
                        kinematic_viscosity,
                    ) * area
                        / link.length
                } else {
                    0.0
                };
                if conductance > 0.0 {
                    edges.push((link.n1, link.n2, conductance));
                }
            }

            let resolved = solve_nodequal(self.net.nodes.len(), &edges, &fixed);
            for link in &self.net.links {
                if link.flow_dir == FlowDirection::Zero {
                    continue;
                }
                let c1 = resolved.get(link.n1).copied().unwrap_or(0.0);
                let c2 = resolved.get(link.n2).copied().unwrap_or(0.0);
                segqual_update(&mut self.pool, link, species_idx, c1, c2);
            }

            for (i, node) in self.net.nodes.iter().enumerate() {
                if let Some(tank_idx) = node.tank {
                    let conductance = edges
                        .iter()
                        .filter(|(a, b, _)| *a == i || *b == i)
                        .map(|(_, _, g)| *g)
                        .sum::<f64>();
                    let node_c = resolved.get(i).copied().unwrap_or(0.0);
                    disperse_tankqual(&mut self.pool, &self.net.tanks[tank_idx], species_idx, node_c, conductance, dt_seconds);
                }
            }
        }
    }

    pub fn finalize(&mut self) -> Result<Vec<f64>, MsxError> {
        if !matches!(self.state, RouterState::Stepping | RouterState::Initialized) {
            return Err(MsxError::ApiMisuse("finalize() requires at least one step".to_string()));
        }
        let n_species = self.net.species.len();
        let mut final_mass = vec![0.0; n_species];
        for link in &self.net.links {
            for h in self.pool.iter_downstream(&link.segments) {
                let seg = self.pool.get(h);
                for i in 0..n_species {
                    final_mass[i] += seg.volume * seg.c[i];
                }
            }
        }
        for tank in &self.net.tanks {
            for list in [&tank.segments, &tank.stagnant_segments] {
                for h in self.pool.iter_downstream(list) {
                    let seg = self.pool.get(h);
                    for i in 0..n_species {
                        final_mass[i] += seg.volume * seg.c[i];
                    }
                }
            }
        }
        self.state = RouterState::Finalized;
        let ratios = self.mass_balance.closure_ratios(&final_mass);
        for (i, ratio) in ratios.iter().enumerate() {
            tracing::info!(species = i, ratio, "mass-balance closure ratio at finalization");
        }
        Ok(ratios)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SegList, Source, SourceType, SpeciesExpr, SpeciesType};
    use crate::options::{Coupling, SolverKind};

    fn inert_species() -> Species {
        Species {
            name: "CL".into(),
            kind: SpeciesType::Bulk,
            units: "MG".into(),
            atol: 1e-6,
            rtol: 1e-6,
            report_precision: 2,
            pipe_expr: SpeciesExpr::none(),
            tank_expr: SpeciesExpr::none(),
        }
    }

    fn line_network() -> Network {
        // reservoir(0) -> junction(1) -> junction(2), single inert species.
        let nodes = vec![
            Node { index: 0, c: vec![0.0], c0: vec![0.0], sources: vec![], tank: Some(0), report: false },
            Node { index: 1, c: vec![0.0], c0: vec![0.0], sources: vec![], tank: None, report: true },
            Node { index: 2, c: vec![0.0], c0: vec![0.0], sources: vec![], tank: None, report: true },
        ];
        let tanks = vec![Tank {
            node: 0,
            area: 0.0,
            initial_volume: 0.0,
            volume: 0.0,
            mix_model: MixModel::Mix1,
            mixing_zone_volume: 0.0,
            parameters: vec![],
            c: vec![5.0],
            reacted: vec![0.0],
            segments: SegList::default(),
            stagnant_segments: SegList::default(),
        }];
        let link = |n1, n2| Link {
            n1,
            n2,
            diameter: 1.0,
            length: 10.0,
            roughness: 100.0,
            parameters: vec![],
            reacted: vec![0.0],
            c0: vec![0.0],
            hyd_vars: [0.0; 9],
            segments: SegList::default(),
            flow_dir: FlowDirection::Zero,
            report: true,
        };
        let links = vec![link(0, 1), link(1, 2)];
        Network {
            species: vec![inert_species()],
            terms: vec![],
            parameters: vec![],
            constants: vec![],
            nodes,
            links,
            tanks,
            patterns: vec![],
            molecular_diffusivities: vec![-1.0],
        }
    }

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let net = line_network();
        let mut router = QualRouter::open(net, QualityOptions::default()).unwrap();
        assert_eq!(router.state(), RouterState::Opened);
        assert!(router.step(&[0.0, 0.0], 1.0).is_err());
        router.init().unwrap();
        assert_eq!(router.state(), RouterState::Initialized);
        assert!(router.init().is_err());
    }

    #[test]
    fn topological_order_respects_flow_direction() {
        let mut net = line_network();
        net.links[0].flow_dir = FlowDirection::Positive;
        net.links[1].flow_dir = FlowDirection::Positive;
        let router = QualRouter::open(net, QualityOptions::default()).unwrap();
        let order = router.topological_order();
        let pos = |n: usize| order.iter().position(|&v| v == n).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2));
    }

    #[test]
    fn topological_order_breaks_cycles_instead_of_stalling() {
        let mut net = line_network();
        net.links.push(crate::model::Link {
            n1: 2,
            n2: 0,
            diameter: 1.0,
            length: 10.0,
            roughness: 100.0,
            parameters: vec![],
            reacted: vec![0.0],
            c0: vec![0.0],
            hyd_vars: [0.0; 9],
            segments: SegList::default(),
            flow_dir: FlowDirection::Positive,
            report: true,
        });
        net.links[0].flow_dir = FlowDirection::Positive;
        net.links[1].flow_dir = FlowDirection::Positive;
        let router = QualRouter::open(net, QualityOptions::default()).unwrap();
        let order = router.topological_order();
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn reservoir_source_advects_downstream_through_junctions() {
        let mut net = line_network();
        net.links[0].flow_dir = FlowDirection::Positive;
        net.links[1].flow_dir = FlowDirection::Positive;
        let mut options = QualityOptions::default();
        options.solver = SolverKind::Euler;
        options.coupling = Coupling::None;
        let mut router = QualRouter::open(net, options).unwrap();
        router.init().unwrap();
        let flows = [1.0, 1.0];
        // pipe volume = pi/4 * 1^2 * 10 ~= 7.85; several steps of 5s move
        // the reservoir's concentration through both pipes.
        for _ in 0..20 {
            router.step(&flows, 5.0).unwrap();
        }
        assert!((router.network().nodes[2].c[0] - 5.0).abs() < 0.5);
    }

    #[test]
    fn concen_source_overrides_junction_concentration() {
        let mut net = line_network();
        net.nodes[1].sources.push(Source {
            source_type: SourceType::Concen,
            species: 0,
            base_strength: 2.0,
            pattern: None,
        });
        net.links[0].flow_dir = FlowDirection::Zero;
        net.links[1].flow_dir = FlowDirection::Zero;
        let mut router = QualRouter::open(net, QualityOptions::default()).unwrap();
        router.init().unwrap();
        router.step(&[0.0, 0.0], 1.0).unwrap();
        assert_eq!(router.network().nodes[1].c[0], 2.0);
    }
}
