//! Running statistics and the periodic CSV report.
//!
//! Tallies accumulate between reports and reset at each report boundary;
//! the report itself is a full-grid sweep formatted as one line of
//! comma-separated values with pipe characters marking the sections.

use std::io::{self, Write};

use crate::pond::Pond;
use crate::vm::NUM_INST;

/// Counters reset after every report.
#[derive(Clone, Debug)]
pub struct ReportCounters {
    /// Per-opcode execution tallies since the last report.
    pub instruction_executions: [f64; NUM_INST],
    /// Cells picked for execution since the last report, dead or alive.
    pub cell_executions: f64,
    pub viable_cells_replaced: u64,
    pub viable_cells_killed: u64,
    pub viable_cell_shares: u64,
    pub mem_special_reads: u64,
    pub mem_private_reads: u64,
    pub mem_output_reads: u64,
    pub mem_input_reads: u64,
    pub mem_special_writes: u64,
    pub mem_private_writes: u64,
    pub mem_output_writes: u64,
    pub mem_input_writes: u64,
}

impl ReportCounters {
    pub fn new() -> Self {
        Self {
            instruction_executions: [0.0; NUM_INST],
            cell_executions: 0.0,
            viable_cells_replaced: 0,
            viable_cells_killed: 0,
            viable_cell_shares: 0,
            mem_special_reads: 0,
            mem_private_reads: 0,
            mem_output_reads: 0,
            mem_input_reads: 0,
            mem_special_writes: 0,
            mem_private_writes: 0,
            mem_output_writes: 0,
            mem_input_writes: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for ReportCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Grid-wide totals computed by a full sweep at each report boundary.
/// The max-energy figures are also what the color schemes scale against
/// until the next report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PondSnapshot {
    pub total_active_cells: u64,
    pub total_living_cells: u64,
    pub total_viable_replicators: u64,
    pub total_energy: u64,
    pub max_cell_energy: u64,
    pub max_living_cell_energy: u64,
    pub total_living_energy: u64,
    pub total_viable_energy: u64,
    pub max_generation: u64,
}

impl PondSnapshot {
    pub fn sweep(pond: &Pond) -> Self {
        let mut snap = Self::default();
        for cell in pond.sweep() {
            if cell.energy == 0 {
                continue;
            }
            snap.total_active_cells += 1;
            snap.total_energy += cell.energy;
            snap.max_cell_energy = snap.max_cell_energy.max(cell.energy);
            if cell.generation > 1 {
                snap.total_living_cells += 1;
                snap.total_living_energy += cell.energy;
                snap.max_living_cell_energy = snap.max_living_cell_energy.max(cell.energy);
                if cell.generation > 2 {
                    snap.total_viable_replicators += 1;
                    snap.total_viable_energy += cell.energy;
                }
            }
            snap.max_generation = snap.max_generation.max(cell.generation);
        }
        snap
    }
}

fn ratio(num: f64, denom: f64) -> f64 {
    if denom > 0.0 {
        num / denom
    } else {
        0.0
    }
}

/// Format one report line. Column order is load-bearing: downstream
/// tooling parses these files positionally.
pub fn csv_line(clock: u64, snap: &PondSnapshot, counters: &ReportCounters) -> String {
    let avg_living = ratio(
        snap.total_living_energy as f64,
        snap.total_living_cells as f64,
    );
    let avg_viable = ratio(
        snap.total_viable_energy as f64,
        snap.total_viable_replicators as f64,
    );

    let mut line = format!(
        "{},{},{},{},{:.2},{:.2},|,{},{},{},{},|,{},{},{},{},{},{},{},{},|,{},{},{},|",
        clock,
        snap.total_energy,
        snap.max_cell_energy,
        snap.max_living_cell_energy,
        avg_living,
        avg_viable,
        snap.total_active_cells,
        snap.total_living_cells,
        snap.total_viable_replicators,
        snap.max_generation,
        counters.mem_special_reads,
        counters.mem_private_reads,
        counters.mem_output_reads,
        counters.mem_input_reads,
        counters.mem_special_writes,
        counters.mem_private_writes,
        counters.mem_output_writes,
        counters.mem_input_writes,
        counters.viable_cells_replaced,
        counters.viable_cells_killed,
        counters.viable_cell_shares,
    );

    let mut total_metabolism = 0.0;
    for &count in &counters.instruction_executions {
        total_metabolism += count;
        line.push_str(&format!(
            ",{:.4}",
            ratio(count, counters.cell_executions)
        ));
    }
    line.push_str(&format!(
        ",{:.4}",
        ratio(total_metabolism, counters.cell_executions)
    ));
    line
}

/// Message for the replicator edge event between two consecutive reports,
/// if one fired.
pub fn replicator_edge(last_viable: u64, now_viable: u64) -> Option<&'static str> {
    if last_viable > 0 && now_viable == 0 {
        Some("Viable replicators have gone extinct. Please reserve a moment of silence.")
    } else if last_viable == 0 && now_viable > 0 {
        Some("Viable replicators have appeared!")
    } else {
        None
    }
}

/// Writes report lines to stdout or a file and announces replicator edge
/// events on stderr.
pub struct StatsWriter {
    out: Box<dyn Write>,
    last_viable: u64,
}

impl StatsWriter {
    pub fn stdout() -> Self {
        Self {
            out: Box::new(io::stdout()),
            last_viable: 0,
        }
    }

    pub fn to_file(path: &str) -> io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            out: Box::new(io::BufWriter::new(file)),
            last_viable: 0,
        })
    }

    pub fn report(
        &mut self,
        clock: u64,
        snap: &PondSnapshot,
        counters: &ReportCounters,
    ) -> io::Result<()> {
        writeln!(self.out, "{}", csv_line(clock, snap, counters))?;
        self.out.flush()?;

        if let Some(event) = replicator_edge(self.last_viable, snap.total_viable_replicators) {
            eprintln!("[EVENT] {event}");
        }
        self.last_viable = snap.total_viable_replicators;
        Ok(())
    }
}
