//! `Project`/`ProjectBuilder`: the single owned
//! context a caller drives end-to-end, gluing the router to a
//! `HydraulicSource` and a `QualitySink` the way `msxqual.c`'s `step()`
//! glues hydraulics to the quality engine.

use crate::error::{MathWarning, MsxError};
use crate::io::trace::HydraulicSource;
use crate::io::output::QualitySink;
use crate::model::{Link, Node, Parameter, Pattern, Species, Tank, Term};
use crate::options::QualityOptions;
use crate::router::{Network, QualRouter, RouterState};

/// Builds a [`Network`] from already-parsed entities (no INP-style lexer is
/// implemented here -- that collaborator sits behind this narrow seam).
#[derive(Default)]
pub struct ProjectBuilder {
    species: Vec<Species>,
    terms: Vec<Term>,
    parameters: Vec<Parameter>,
    constants: Vec<f64>,
    nodes: Vec<Node>,
    links: Vec<Link>,
    tanks: Vec<Tank>,
    patterns: Vec<Pattern>,
    molecular_diffusivities: Option<Vec<f64>>,
    options: QualityOptions,
}

impl ProjectBuilder {
    pub fn new() -> Self {
        ProjectBuilder::default()
    }

    pub fn species(mut self, species: Vec<Species>) -> Self {
        self.species = species;
        self
    }

    pub fn terms(mut self, terms: Vec<Term>) -> Self {
        self.terms = terms;
        self
    }

    pub fn parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn constants(mut self, constants: Vec<f64>) -> Self {
        self.constants = constants;
        self
    }

    pub fn nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn links(mut self, links: Vec<Link>) -> Self {
        self.links = links;
        self
    }

    pub fn tanks(mut self, tanks: Vec<Tank>) -> Self {
        self.tanks = tanks;
        self
    }

    pub fn patterns(mut self, patterns: Vec<Pattern>) -> Self {
        self.patterns = patterns;
        self
    }

    /// One entry per species; a negative value disables dispersion for
    /// that species. Defaults to "disabled for every species" if never
    /// called.
    pub fn molecular_diffusivities(mut self, diffusivities: Vec<f64>) -> Self {
        self.molecular_diffusivities = Some(diffusivities);
        self
    }

    pub fn options(mut self, options: QualityOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<Project, MsxError> {
        let n_species = self.species.len();
        let molecular_diffusivities = self.molecular_diffusivities.unwrap_or_else(|| vec![-1.0; n_species]);
        let net = Network {
            species: self.species,
            terms: self.terms,
            parameters: self.parameters,
            constants: self.constants,
            nodes: self.nodes,
            links: self.links,
            tanks: self.tanks,
            patterns: self.patterns,
            molecular_diffusivities,
        };
        Project::open(net, self.options.normalized())
    }
}

/// Owns the network, the router, and the accumulated math-warning log for
/// one simulation run. There is exactly one `Project` per run; nothing here
/// is process-global.
pub struct Project {
    router: QualRouter,
    warnings: Vec<MathWarning>,
}

impl Project {
    pub fn open(net: Network, options: QualityOptions) -> Result<Self, MsxError> {
        let _span = tracing::info_span!("project_open", n_species = net.species.len(), n_nodes = net.nodes.len(), n_links = net.links.len()).entered();
        let mut router = QualRouter::open(net, options)?;
        router.init()?;
        tracing::info!("project opened and initialized");
        Ok(Project {
            router,
            warnings: Vec::new(),
        })
    }

    pub fn network(&self) -> &Network {
        self.router.network()
    }

    pub fn state(&self) -> RouterState {
        self.router.state()
    }

    /// Math warnings recorded so far across every step of this run
    /// (non-fatal, first-occurrence-per-step).
    pub fn warnings(&self) -> &[MathWarning] {
        &self.warnings
    }

    /// Drives the whole run: reads hydraulic events until the source is
    /// exhausted, subdividing each event's duration into quality time
    /// steps (`QualityOptions::qstep_ms`), reporting a period to `sink`
    /// every `reporting_step_seconds`, and finalizing at the end.
    pub fn run(
        &mut self,
        source: &mut impl HydraulicSource,
        sink: &mut impl QualitySink,
        reporting_step_seconds: u32,
    ) -> Result<Vec<f64>, MsxError> {
        let qstep = self.router.qstep_seconds();
        let reporting_step = reporting_step_seconds as f64;
        let mut sim_time = 0.0f64;
        let mut next_report = reporting_step;
        let mut event_count = 0usize;

        while let Some(event) = source.next_event()? {
            let _span = tracing::info_span!("hydraulic_event", index = event_count, time = event.time).entered();
            tracing::info!(time_step = event.time_step, "hydraulic event boundary");
            let flows: Vec<f64> = event.flow.iter().map(|&q| q as f64).collect();
            let mut remaining = event.time_step as f64;
            while remaining > 1e-9 {
                let dt = qstep.min(remaining);
                let report = self.router.step(&flows, dt)?;
                self.warnings.extend(report.warnings);
                sim_time += dt;
                remaining -= dt;

                while reporting_step > 0.0 && sim_time + 1e-6 >= next_report {
                    self.write_period(sink)?;
                    next_report += reporting_step;
                }
            }
            event_count += 1;
        }

        self.router.finalize()
    }

    fn write_period(&self, sink: &mut impl QualitySink) -> Result<(), MsxError> {
        let net = self.router.network();
        let n_species = net.species.len();
        let mut node_c = vec![0f32; n_species * net.nodes.len()];
        for (s, chunk) in node_c.chunks_mut(net.nodes.len()).enumerate() {
            for (n, slot) in chunk.iter_mut().enumerate() {
                *slot = net.nodes[n].c.get(s).copied().unwrap_or(0.0) as f32;
            }
        }
        let n_links = net.links.len();
        let mut link_c = vec![0f32; n_species * n_links];
        for l in 0..n_links {
            let c = self.router.link_concentration(l);
            for s in 0..n_species {
                link_c[s * n_links + l] = c.get(s).copied().unwrap_or(0.0) as f32;
            }
        }
        sink.write_period(&node_c, &link_c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::trace::VecHydraulicSource;
    use crate::model::{FlowDirection, SegList, Source, SourceType, SpeciesExpr, SpeciesType};

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

    struct RecordingSink {
        periods: Vec<(Vec<f32>, Vec<f32>)>,
    }

    impl QualitySink for RecordingSink {
        fn write_period(&mut self, node_c: &[f32], link_c: &[f32]) -> Result<(), MsxError> {
            self.periods.push((node_c.to_vec(), link_c.to_vec()));
            Ok(())
        }
    }

    fn two_node_network() -> Network {
        let nodes = vec![
            Node {
                index: 0,
                c: vec![0.0],
                c0: vec![0.0],
                sources: vec![Source {
                    source_type: SourceType::Concen,
                    species: 0,
                    base_strength: 1.0,
                    pattern: None,
                }],
                tank: None,
                report: true,
            },
            Node { index: 1, c: vec![0.0], c0: vec![0.0], sources: vec![], tank: None, report: true },
        ];
        let link = Link {
            n1: 0,
            n2: 1,
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
        };
        Network {
            species: vec![inert_species()],
            terms: vec![],
            parameters: vec![],
            constants: vec![],
            nodes,
            links: vec![link],
            tanks: vec![],
            patterns: vec![],
            molecular_diffusivities: vec![-1.0],
        }
    }

    #[test]
    fn builder_produces_an_opened_and_initialized_project() {
        let project = ProjectBuilder::new()
            .species(vec![inert_species()])
            .nodes(vec![Node::default(), Node::default()])
            .build()
            .unwrap();
        assert_eq!(project.state(), RouterState::Initialized);
    }

    #[test]
    fn run_drives_hydraulics_to_exhaustion_and_reports_periods() {
        let net = two_node_network();
        let mut options = QualityOptions::default();
        options.qstep_ms = 5_000;
        let mut project = Project::open(net, options).unwrap();

        let event = crate::io::trace::HydraulicEvent {
            time: 0,
            demand: vec![0.0, 0.0],
            head: vec![0.0, 0.0],
            flow: vec![1.0],
            status: vec![1.0],
            time_step: 20,
        };
        let mut source = VecHydraulicSource::new(2, 1, vec![event]);
        let mut sink = RecordingSink { periods: Vec::new() };

        let ratios = project.run(&mut source, &mut sink, 10).unwrap();
        assert_eq!(ratios.len(), 1);
        assert_eq!(project.state(), RouterState::Finalized);
        assert!(!sink.periods.is_empty());
    }
}
