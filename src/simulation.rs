//! The core clock loop: periodic reporting, dumping and refresh, energy
//! inflow, and random-cell execution.
//!
//! Everything runs on one thread. Within a tick the order is fixed:
//! stop check, report, refresh, dump, inflow, execute. The PRNG is
//! consumed in exactly that order, so a seed fully determines a run.
//!
//! Note: some accessors are kept for embedders even if the console front
//! end does not call them.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use crate::dump;
use crate::mt19937::Mt19937;
use crate::pond::{next_cell_id, Pond};
use crate::render::{self, ColorScheme};
use crate::stats::{PondSnapshot, ReportCounters, StatsWriter};
use crate::topology::Neighborhood;
use crate::vm::{Sense, Vm, VmParams, INST_MASK};

/// Runtime parameters, flattened out of the configuration.
#[derive(Clone, Debug)]
pub struct Params {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub topology: Neighborhood,
    pub seed: u32,
    pub mutation_rate: u32,
    pub inflow_frequency: u64,
    pub inflow_rate_base: u64,
    /// Extra energy per seeding, uniform in [0, variation). None keeps
    /// the inflow rate constant.
    pub inflow_rate_variation: Option<u64>,
    pub total_energy_cap: Option<u64>,
    pub cell_energy_cap: Option<u64>,
    pub failed_kill_penalty: u64,
    pub reproduction_cost: u64,
    pub report_frequency: u64,
    pub dump_frequency: Option<u64>,
    pub refresh_frequency: u64,
    pub stop_at: Option<u64>,
    pub exec_start: usize,
    pub combine_sense: Sense,
    pub clear_ram: bool,
    pub decay_ram: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            depth: 512,
            topology: Neighborhood::Six,
            seed: 1111,
            mutation_rate: 100_000,
            inflow_frequency: 100,
            inflow_rate_base: 2000,
            inflow_rate_variation: Some(4000),
            total_energy_cap: None,
            cell_energy_cap: Some(10_000),
            failed_kill_penalty: 3,
            reproduction_cost: 20,
            report_frequency: 1_000_000,
            dump_frequency: Some(10_000_000),
            refresh_frequency: 20_000,
            stop_at: None,
            exec_start: 0,
            combine_sense: Sense::Negative,
            clear_ram: false,
            decay_ram: false,
        }
    }
}

/// Observer for the periodic boundaries. The console wiring writes CSV,
/// dump files and frames; tests plug in recorders.
pub trait EventSink {
    fn report(&mut self, _clock: u64, _snapshot: &PondSnapshot, _counters: &ReportCounters) {}

    /// Called at every refresh boundary. Returning false stops the run,
    /// which is how a front end delivers its quit event.
    fn refresh(&mut self, _clock: u64, _pond: &Pond, _snapshot: &PondSnapshot) -> bool {
        true
    }

    fn dump(&mut self, _clock: u64, _pond: &Pond) {}
}

/// Sink that ignores every event, for headless runs and tests.
pub struct NullSink;

impl EventSink for NullSink {}

pub struct Simulation {
    params: Params,
    vm_params: VmParams,
    pond: Pond,
    rng: Mt19937,
    vm: Vm,
    clock: u64,
    cell_id_counter: u64,
    counters: ReportCounters,
    snapshot: PondSnapshot,
    inflow_events: u64,
}

impl Simulation {
    pub fn new(params: Params) -> Self {
        let pond = Pond::new(params.width, params.height, params.depth);
        let rng = Mt19937::warmed(params.seed);
        let vm = Vm::new(params.depth);
        let vm_params = VmParams {
            topology: params.topology,
            mutation_rate: params.mutation_rate,
            failed_kill_penalty: params.failed_kill_penalty,
            reproduction_cost: params.reproduction_cost,
            exec_start: params.exec_start,
            combine_sense: params.combine_sense,
            clear_ram: params.clear_ram,
            decay_ram: params.decay_ram,
        };
        Self {
            params,
            vm_params,
            pond,
            rng,
            vm,
            clock: 0,
            cell_id_counter: 0,
            counters: ReportCounters::new(),
            snapshot: PondSnapshot::default(),
            inflow_events: 0,
        }
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn pond(&self) -> &Pond {
        &self.pond
    }

    pub fn pond_mut(&mut self) -> &mut Pond {
        &mut self.pond
    }

    pub fn counters(&self) -> &ReportCounters {
        &self.counters
    }

    /// Totals as of the most recent report sweep.
    pub fn snapshot(&self) -> &PondSnapshot {
        &self.snapshot
    }

    /// Seedings performed so far, including ones whose energy add was
    /// blocked by a cap.
    pub fn inflow_events(&self) -> u64 {
        self.inflow_events
    }

    /// Dump one cell's genome to stderr if it is a viable replicator.
    pub fn inspect(&self, x: usize, y: usize) {
        let cell = self.pond.cell(x, y);
        if cell.energy > 0 && cell.is_viable() {
            eprintln!("[INTERFACE] Genome of cell at ({x}, {y}):");
            let mut line = Vec::new();
            if dump::write_cell(&mut line, cell).is_ok() {
                eprint!("{}", String::from_utf8_lossy(&line));
            }
        }
    }

    /// One clock step. Returns false once the run is over.
    pub fn tick(&mut self, sink: &mut dyn EventSink) -> bool {
        if let Some(stop_at) = self.params.stop_at {
            if self.clock >= stop_at {
                if self.params.dump_frequency.is_some() {
                    sink.dump(self.clock, &self.pond);
                }
                eprintln!("[QUIT] Stop tick reached");
                return false;
            }
        }

        if fires(self.clock, self.params.report_frequency) {
            self.snapshot = PondSnapshot::sweep(&self.pond);
            sink.report(self.clock, &self.snapshot, &self.counters);
            self.counters.reset();
        }

        if fires(self.clock, self.params.refresh_frequency)
            && !sink.refresh(self.clock, &self.pond, &self.snapshot)
        {
            eprintln!("[QUIT] Quit signal received!");
            return false;
        }

        if let Some(freq) = self.params.dump_frequency {
            if fires(self.clock, freq) {
                sink.dump(self.clock, &self.pond);
            }
        }

        if fires(self.clock, self.params.inflow_frequency) {
            self.seed_random_cell();
        }

        let x = (self.rng.next_word() % self.params.width as u64) as usize;
        let y = (self.rng.next_word() % self.params.height as u64) as usize;
        self.vm.run_cell(
            &mut self.pond,
            &mut self.rng,
            &mut self.counters,
            &self.vm_params,
            &mut self.cell_id_counter,
            x,
            y,
        );

        self.clock += 1;
        true
    }

    pub fn run(&mut self, sink: &mut dyn EventSink) {
        while self.tick(sink) {}
    }

    /// Introduce a random cell somewhere with a burst of energy. Seeding
    /// injects both energy and entropy: the cell's identity is reset and
    /// its genome rewritten with noise even when an energy cap blocks the
    /// energy itself.
    fn seed_random_cell(&mut self) {
        let x = (self.rng.next_word() % self.params.width as u64) as usize;
        let y = (self.rng.next_word() % self.params.height as u64) as usize;
        let id = next_cell_id(&mut self.cell_id_counter);

        let total_ok = self
            .params
            .total_energy_cap
            .map_or(true, |cap| self.snapshot.total_energy < cap);
        let cell_ok = self
            .params
            .cell_energy_cap
            .map_or(true, |cap| self.pond.cell(x, y).energy < cap);

        let base = self.params.inflow_rate_base;
        let variation = self.params.inflow_rate_variation;
        let clear_ram = self.params.clear_ram;

        let rng = &mut self.rng;
        let cell = self.pond.cell_mut(x, y);
        cell.id = id;
        cell.parent_id = 0;
        cell.lineage = id;
        cell.generation = 0;
        cell.logo = 0;
        cell.facing = 0;
        if total_ok && cell_ok {
            let extra = match variation {
                Some(v) if v > 0 => rng.next_word() % v,
                _ => 0,
            };
            cell.energy += base + extra;
        }
        for codon in cell.genome.iter_mut() {
            *codon = rng.next_word() as u8 & INST_MASK;
        }
        for byte in cell.ram.iter_mut() {
            *byte = if clear_ram { 0 } else { rng.next_word() as u8 };
        }

        self.inflow_events += 1;
    }
}

fn fires(clock: u64, frequency: u64) -> bool {
    frequency != 0 && clock % frequency == 0
}

/// Console wiring: CSV reports, dump files, optional PPM frames.
pub struct ConsoleSink {
    pub stats: StatsWriter,
    pub dump_dir: PathBuf,
    pub frames: Option<FrameOutput>,
}

pub struct FrameOutput {
    pub dir: PathBuf,
    pub scheme: ColorScheme,
    pub frame: Vec<u8>,
}

impl EventSink for ConsoleSink {
    fn report(&mut self, clock: u64, snapshot: &PondSnapshot, counters: &ReportCounters) {
        if let Err(err) = self.stats.report(clock, snapshot, counters) {
            eprintln!("[WARNING] Failed to write report: {err}");
        }
    }

    fn refresh(&mut self, clock: u64, pond: &Pond, snapshot: &PondSnapshot) -> bool {
        if let Some(frames) = &mut self.frames {
            render::fill_frame(pond, frames.scheme, snapshot, &mut frames.frame);
            if let Err(err) = render::save_frame(
                Path::new(&frames.dir),
                clock,
                pond.width(),
                pond.height(),
                &frames.frame,
            ) {
                eprintln!("[WARNING] Failed to write frame: {err}");
            }
        }
        true
    }

    fn dump(&mut self, clock: u64, pond: &Pond) {
        dump::dump_viable(pond, clock, &self.dump_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::csv_line;
    use crate::vm::{OP_FWD, OP_INC, OP_STOP, OP_WRITEO};

    fn small_params() -> Params {
        Params {
            width: 64,
            height: 64,
            depth: 64,
            topology: Neighborhood::Four,
            seed: 1111,
            report_frequency: 0,
            dump_frequency: None,
            refresh_frequency: 0,
            ..Params::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        reports: Vec<String>,
        dumps: Vec<u64>,
        refreshes: Vec<u64>,
    }

    impl EventSink for Recorder {
        fn report(&mut self, clock: u64, snapshot: &PondSnapshot, counters: &ReportCounters) {
            self.reports.push(csv_line(clock, snapshot, counters));
        }

        fn refresh(&mut self, clock: u64, _pond: &Pond, _snapshot: &PondSnapshot) -> bool {
            self.refreshes.push(clock);
            true
        }

        fn dump(&mut self, clock: u64, _pond: &Pond) {
            self.dumps.push(clock);
        }
    }

    #[test]
    fn test_inflow_count_over_ten_thousand_ticks() {
        let mut sim = Simulation::new(small_params());
        let mut sink = NullSink;
        for _ in 0..10_000 {
            assert!(sim.tick(&mut sink));
        }
        // Seeding fires at every multiple of 100, clock 0 included.
        assert_eq!(sim.inflow_events(), 100);
        let snap = PondSnapshot::sweep(sim.pond());
        assert!(snap.total_energy > 0);
    }

    #[test]
    fn test_grid_invariants_after_long_run() {
        let mut sim = Simulation::new(small_params());
        let mut sink = NullSink;
        for _ in 0..10_000 {
            sim.tick(&mut sink);
        }
        let mut seen_ids = std::collections::HashSet::new();
        for cell in sim.pond().sweep() {
            assert!(cell.logo < 32);
            assert!(cell.facing < 32);
            assert!(cell.genome.iter().all(|&g| g < 32));
            if cell.generation == 0 && cell.id != 0 {
                assert_eq!(cell.parent_id, 0);
            }
            if cell.id != 0 {
                assert!(seen_ids.insert(cell.id), "duplicate id {}", cell.id);
            }
        }
    }

    #[test]
    fn test_identical_seeds_give_identical_runs() {
        let mut params = small_params();
        params.report_frequency = 1000;
        params.stop_at = Some(5000);

        let run = |params: Params| {
            let mut sim = Simulation::new(params);
            let mut recorder = Recorder::default();
            sim.run(&mut recorder);
            (recorder.reports, PondSnapshot::sweep(sim.pond()))
        };
        let (reports_a, snap_a) = run(params.clone());
        let (reports_b, snap_b) = run(params);

        assert_eq!(reports_a.len(), 5);
        assert_eq!(reports_a, reports_b);
        assert_eq!(snap_a, snap_b);
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = small_params();
        a.seed = 1;
        let mut b = small_params();
        b.seed = 2;
        let mut sim_a = Simulation::new(a);
        let mut sim_b = Simulation::new(b);
        let mut sink = NullSink;
        for _ in 0..500 {
            sim_a.tick(&mut sink);
            sim_b.tick(&mut sink);
        }
        assert_ne!(
            PondSnapshot::sweep(sim_a.pond()),
            PondSnapshot::sweep(sim_b.pond())
        );
    }

    #[test]
    fn test_dead_cells_never_execute_instructions() {
        let mut params = small_params();
        // No inflow: the pond stays empty of energy.
        params.inflow_frequency = 0;
        let mut sim = Simulation::new(params);
        let mut sink = NullSink;
        for _ in 0..100 {
            sim.tick(&mut sink);
        }
        // Every tick still counts an execution attempt, but no
        // instruction ever runs.
        assert_eq!(sim.counters().cell_executions, 100.0);
        assert!(sim
            .counters()
            .instruction_executions
            .iter()
            .all(|&count| count == 0.0));
    }

    #[test]
    fn test_boundary_cadence_and_final_dump() {
        let mut params = small_params();
        params.report_frequency = 40;
        params.refresh_frequency = 25;
        params.dump_frequency = Some(50);
        params.stop_at = Some(100);
        let mut sim = Simulation::new(params);
        let mut recorder = Recorder::default();
        sim.run(&mut recorder);

        assert_eq!(sim.clock(), 100);
        assert_eq!(recorder.reports.len(), 3); // ticks 0, 40, 80
        assert_eq!(recorder.refreshes, vec![0, 25, 50, 75]);
        // Periodic dumps at 0 and 50 plus the final dump at the stop.
        assert_eq!(recorder.dumps, vec![0, 50, 100]);
    }

    #[test]
    fn test_seeding_respects_cell_energy_cap() {
        let mut params = small_params();
        params.cell_energy_cap = Some(1000);
        let mut sim = Simulation::new(params);
        for cell_y in 0..64 {
            for cell_x in 0..64 {
                sim.pond_mut().cell_mut(cell_x, cell_y).energy = 1000;
            }
        }
        sim.seed_random_cell();

        // The seeded cell kept its identity reset and fresh genome but
        // gained no energy.
        let seeded = sim.pond().sweep().find(|c| c.id == 1).unwrap();
        assert_eq!(seeded.energy, 1000);
        assert_eq!(seeded.parent_id, 0);
        assert_eq!(seeded.generation, 0);
        assert!(seeded.genome.iter().any(|&g| g != OP_STOP));
    }

    #[test]
    fn test_seeding_adds_energy_within_bounds() {
        let mut sim = Simulation::new(small_params());
        sim.seed_random_cell();
        let seeded = sim.pond().sweep().find(|c| c.id == 1).unwrap();
        assert!(seeded.energy >= 2000);
        assert!(seeded.energy < 6000);
        assert_eq!(seeded.lineage, 1);
    }

    #[test]
    fn test_total_energy_cap_checks_last_report() {
        let mut params = small_params();
        params.total_energy_cap = Some(1);
        let mut sim = Simulation::new(params);

        // The cached snapshot still reads zero total energy, so the first
        // seeding adds energy despite the cap.
        sim.seed_random_cell();
        let first_energy = sim
            .pond()
            .sweep()
            .find(|c| c.id == 1)
            .map(|c| c.energy)
            .unwrap();
        assert!(first_energy >= 2000);

        // After a sweep shows the pond over the cap, seeding rewrites the
        // cell but adds nothing.
        sim.snapshot = PondSnapshot::sweep(sim.pond());
        sim.seed_random_cell();
        let second_energy = sim
            .pond()
            .sweep()
            .find(|c| c.id == 2)
            .map(|c| c.energy)
            .unwrap();
        assert!(second_energy == 0 || second_energy == first_energy);
    }

    #[test]
    fn test_clear_ram_seeding() {
        let mut params = small_params();
        params.clear_ram = true;
        let mut sim = Simulation::new(params);
        sim.seed_random_cell();
        let seeded = sim.pond().sweep().find(|c| c.id == 1).unwrap();
        assert_eq!(seeded.ram, [0; crate::pond::RAM_SIZE]);
    }

    #[test]
    fn test_staged_replicator_copies_itself() {
        // A hand-staged copier: write codons into the output buffer, one
        // per pass, then halt; the handoff clones the buffer east.
        let mut params = small_params();
        params.mutation_rate = 0;
        params.inflow_frequency = 0;
        let mut sim = Simulation::new(params);

        let program: Vec<u8> = [OP_INC, OP_WRITEO, OP_FWD]
            .iter()
            .cycle()
            .take(60)
            .copied()
            .collect();
        {
            let cell = sim.pond_mut().cell_mut(0, 0);
            cell.genome[..60].copy_from_slice(&program);
            cell.energy = 100_000;
            cell.generation = 3;
            cell.id = 9;
            cell.lineage = 9;
            cell.facing = 1; // east
        }
        sim.pond_mut().cell_mut(1, 0).energy = 500;

        let mut counters = ReportCounters::new();
        sim.vm.run_cell(
            &mut sim.pond,
            &mut sim.rng,
            &mut counters,
            &sim.vm_params,
            &mut sim.cell_id_counter,
            0,
            0,
        );

        let offspring = sim.pond().cell(1, 0);
        assert_eq!(offspring.parent_id, 9);
        assert_eq!(offspring.lineage, 9);
        assert_eq!(offspring.generation, 4);
        assert_ne!(offspring.genome[0], OP_STOP);
    }
}
