//! The cell virtual machine.
//!
//! A tiny register machine over an evolvable 32-opcode instruction set:
//! every 5-bit value decodes to a defined operation, so any mutated genome
//! still runs. Execution state is one 8-bit register, an I/O pointer into
//! the genome and output buffer, a 5-bit memory-map pointer, and a
//! LOOP/REP stack. Error conditions are in-band: stack overflow halts,
//! division by zero yields zero, denied neighbor access is skipped.
//!
//! Note: some accessors are kept for embedders even if the main loop does
//! not call them.

#![allow(dead_code)]

use crate::mt19937::Mt19937;
use crate::pond::{next_cell_id, Cell, Pond, RAM_SIZE};
use crate::stats::ReportCounters;
use crate::topology::Neighborhood;

pub const INST_BITS: u32 = 5;
pub const NUM_INST: usize = 1 << INST_BITS;
pub const INST_MASK: u8 = (NUM_INST - 1) as u8;
pub const LOGO_MASK: u8 = 0x1f;
pub const FACING_MASK: u8 = 0x1f;
pub const MEM_MASK: u8 = 0x1f;
pub const RAM_MASK: u64 = (RAM_SIZE - 1) as u64;

pub const OP_STOP: u8 = 0x00;
pub const OP_FWD: u8 = 0x01;
pub const OP_BACK: u8 = 0x02;
pub const OP_INC: u8 = 0x03;
pub const OP_DEC: u8 = 0x04;
pub const OP_READG: u8 = 0x05;
pub const OP_WRITEG: u8 = 0x06;
pub const OP_READO: u8 = 0x07;
pub const OP_WRITEO: u8 = 0x08;
pub const OP_LOOP: u8 = 0x09;
pub const OP_REP: u8 = 0x0a;
pub const OP_TURN: u8 = 0x0b;
pub const OP_XCHG: u8 = 0x0c;
pub const OP_KILL: u8 = 0x0d;
pub const OP_SHARE: u8 = 0x0e;
pub const OP_ZERO: u8 = 0x0f;
pub const OP_SETP: u8 = 0x10;
pub const OP_NEXTB: u8 = 0x11;
pub const OP_PREVB: u8 = 0x12;
pub const OP_NEXTM: u8 = 0x13;
pub const OP_PREVM: u8 = 0x14;
pub const OP_READM: u8 = 0x15;
pub const OP_WRITEM: u8 = 0x16;
pub const OP_CLEARM: u8 = 0x17;
pub const OP_ADD: u8 = 0x18;
pub const OP_SUB: u8 = 0x19;
pub const OP_MUL: u8 = 0x1a;
pub const OP_DIV: u8 = 0x1b;
pub const OP_SHL: u8 = 0x1c;
pub const OP_SHR: u8 = 0x1d;
pub const OP_SETMP: u8 = 0x1e;
pub const OP_RAND: u8 = 0x1f;

/// Interaction sense for permission checks. Negative covers kill and
/// reproduce-overwrite (permit when the 4-bit roll is at most the logo
/// distance), Positive covers share and neighbor RAM writes (permit when
/// the roll is at least the distance).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sense {
    Negative,
    Positive,
}

impl Sense {
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Sense::Negative),
            1 => Some(Sense::Positive),
            _ => None,
        }
    }
}

/// Stochastic permission check against the accessed cell's logo. Cells
/// that never had a parent are always accessible, so fresh noise cells
/// can be replaced or eaten by anything.
pub fn access_allowed(target: &Cell, guess: u8, sense: Sense, rng: &mut Mt19937) -> bool {
    let distance = u64::from(((target.logo ^ guess) & LOGO_MASK).count_ones());
    let roll = rng.next_word() & 0xf;
    let permitted = match sense {
        Sense::Negative => roll <= distance,
        Sense::Positive => roll >= distance,
    };
    permitted || target.parent_id == 0
}

/// Knobs of the execution engine, flattened out of the configuration.
pub struct VmParams {
    pub topology: Neighborhood,
    /// Probability of a per-instruction mutation, out of 2^32.
    pub mutation_rate: u32,
    /// Divisor applied to energy when a kill on a viable neighbor fails.
    pub failed_kill_penalty: u64,
    pub reproduction_cost: u64,
    /// Genome index where execution starts and wraps back to.
    pub exec_start: usize,
    pub combine_sense: Sense,
    /// Zero offspring and seeded RAM instead of randomizing it.
    pub clear_ram: bool,
    /// Scramble one RAM byte whenever a cell ends a tick with no energy.
    pub decay_ram: bool,
}

/// Read through the 5-bit memory map. Slots 0x00-0x07 are the cell's
/// special values, 0x08-0x0f its private RAM, 0x10-0x17 its public RAM,
/// and 0x18-0x1f the public RAM of the faced neighbor.
fn read_mem(
    pond: &Pond,
    topology: Neighborhood,
    counters: &mut ReportCounters,
    x: usize,
    y: usize,
    ptr: u8,
) -> u8 {
    let cell = pond.cell(x, y);
    match ptr & MEM_MASK {
        0x00 => {
            counters.mem_special_reads += 1;
            cell.logo
        }
        0x01 => {
            counters.mem_special_reads += 1;
            cell.facing
        }
        0x02 => {
            counters.mem_special_reads += 1;
            // Energy bucketed to 5 bits: 0 is dead, 31 saturated.
            if cell.energy == 0 {
                0
            } else if cell.energy > 126_975 {
                31
            } else {
                (1 + (cell.energy >> 12)) as u8
            }
        }
        0x03 => {
            counters.mem_special_reads += 1;
            (cell.lineage & 0xff) as u8
        }
        0x04 => {
            counters.mem_special_reads += 1;
            (cell.id & 0xff) as u8
        }
        0x05 => {
            counters.mem_special_reads += 1;
            (cell.parent_id & 0xff) as u8
        }
        0x06 => {
            counters.mem_special_reads += 1;
            ((cell.generation >> 8) & 0xff) as u8
        }
        0x07 => {
            counters.mem_special_reads += 1;
            (cell.generation & 0xff) as u8
        }
        0x08..=0x0f => {
            counters.mem_private_reads += 1;
            cell.ram[(ptr & 0x7) as usize]
        }
        0x10..=0x17 => {
            counters.mem_output_reads += 1;
            cell.ram[8 + (ptr & 0x7) as usize]
        }
        _ => {
            // Neighbor public RAM reads are unrestricted.
            counters.mem_input_reads += 1;
            let (nx, ny) =
                topology.neighbor(pond.width(), pond.height(), x, y, cell.facing);
            pond.cell(nx, ny).ram[8 + (ptr & 0x7) as usize]
        }
    }
}

/// Write through the memory map. Slots 0x02-0x07 are read-only; writes to
/// the faced neighbor's public RAM are permission-gated.
fn write_mem(
    pond: &mut Pond,
    topology: Neighborhood,
    counters: &mut ReportCounters,
    rng: &mut Mt19937,
    x: usize,
    y: usize,
    ptr: u8,
    value: u8,
) {
    match ptr & MEM_MASK {
        0x00 => {
            counters.mem_special_writes += 1;
            pond.cell_mut(x, y).logo = value & LOGO_MASK;
        }
        0x01 => {
            counters.mem_special_writes += 1;
            pond.cell_mut(x, y).facing = value & FACING_MASK;
        }
        0x02..=0x07 => {
            counters.mem_special_writes += 1;
        }
        0x08..=0x0f => {
            counters.mem_private_writes += 1;
            pond.cell_mut(x, y).ram[(ptr & 0x7) as usize] = value;
        }
        0x10..=0x17 => {
            counters.mem_output_writes += 1;
            pond.cell_mut(x, y).ram[8 + (ptr & 0x7) as usize] = value;
        }
        _ => {
            counters.mem_input_writes += 1;
            let (logo, facing) = {
                let cell = pond.cell(x, y);
                (cell.logo, cell.facing)
            };
            let (nx, ny) = topology.neighbor(pond.width(), pond.height(), x, y, facing);
            let neighbor = pond.cell_mut(nx, ny);
            if access_allowed(neighbor, logo, Sense::Positive, rng) {
                neighbor.ram[8 + (ptr & 0x7) as usize] = value;
            }
        }
    }
}

/// Execution engine. Scratch buffers are allocated once and reused for
/// every activation.
pub struct Vm {
    output: Vec<u8>,
    loop_stack: Vec<usize>,
}

impl Vm {
    pub fn new(depth: usize) -> Self {
        Self {
            output: vec![OP_STOP; depth],
            loop_stack: Vec::with_capacity(depth),
        }
    }

    /// Candidate offspring staged by the most recent activation.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Run one full activation of the cell at (x, y): execute until STOP,
    /// energy exhaustion or stack overflow, then hand the output buffer to
    /// the faced neighbor if it holds a candidate offspring.
    pub fn run_cell(
        &mut self,
        pond: &mut Pond,
        rng: &mut Mt19937,
        counters: &mut ReportCounters,
        params: &VmParams,
        cell_id_counter: &mut u64,
        x: usize,
        y: usize,
    ) {
        let depth = pond.depth();
        let width = pond.width();
        let height = pond.height();

        self.output.fill(OP_STOP);
        self.loop_stack.clear();
        let mut reg: u8 = 0;
        let mut io_ptr: usize = 0;
        let mut mem_ptr: u8 = 0;
        let mut inst_ptr: usize = params.exec_start;
        let mut false_loop_depth: usize = 0;
        let mut stop = false;

        // Dead cells still count as an execution attempt.
        counters.cell_executions += 1.0;

        while pond.cell(x, y).energy > 0 && !stop {
            let mut inst = pond.cell(x, y).genome[inst_ptr];

            // Mutations frob the live VM state rather than the genome, so
            // a copy in progress picks up insertions, deletions and
            // duplications depending on when the frob lands.
            if (rng.next_word() & 0xffff_ffff) < u64::from(params.mutation_rate) {
                let t = rng.next_word();
                if t & 0x20000 != 0 {
                    if t & 0x10000 != 0 {
                        inst = (t as u8) & INST_MASK;
                    } else {
                        reg = t as u8;
                    }
                } else if t & 0x10000 != 0 {
                    mem_ptr = (t as u8) & MEM_MASK;
                } else {
                    pond.cell_mut(x, y).ram[((t >> 8) & RAM_MASK) as usize] = t as u8;
                }
            }

            // Each instruction processed costs one unit of energy.
            pond.cell_mut(x, y).energy -= 1;

            if false_loop_depth > 0 {
                // Inside a never-taken LOOP body only the bracketing
                // opcodes matter; nothing here is tallied.
                if inst == OP_LOOP {
                    false_loop_depth += 1;
                } else if inst == OP_REP {
                    false_loop_depth -= 1;
                }
            } else {
                counters.instruction_executions[inst as usize] += 1.0;

                match inst {
                    OP_STOP => stop = true,
                    OP_FWD => {
                        io_ptr += 1;
                        if io_ptr >= depth {
                            io_ptr = 0;
                        }
                    }
                    OP_BACK => {
                        io_ptr = if io_ptr == 0 { depth - 1 } else { io_ptr - 1 };
                    }
                    OP_INC => reg = reg.wrapping_add(1),
                    OP_DEC => reg = reg.wrapping_sub(1),
                    OP_READG => reg = pond.cell(x, y).genome[io_ptr],
                    OP_WRITEG => pond.cell_mut(x, y).genome[io_ptr] = reg & INST_MASK,
                    OP_READO => reg = self.output[io_ptr],
                    OP_WRITEO => self.output[io_ptr] = reg & INST_MASK,
                    OP_LOOP => {
                        if reg != 0 {
                            if self.loop_stack.len() >= depth {
                                // Stack overflow ends execution.
                                stop = true;
                            } else {
                                self.loop_stack.push(inst_ptr);
                            }
                        } else {
                            false_loop_depth = 1;
                        }
                    }
                    OP_REP => {
                        if let Some(target) = self.loop_stack.pop() {
                            if reg != 0 {
                                inst_ptr = target;
                                // Rerun the LOOP itself; skip the advance.
                                continue;
                            }
                        }
                    }
                    OP_TURN => {
                        // Combine: borrow a genome byte from a compatible
                        // viable neighbor, or fall back to our own.
                        let me = pond.cell(x, y);
                        if me.generation > 2 {
                            let (nx, ny) =
                                params.topology.neighbor(width, height, x, y, me.facing);
                            let neighbor = pond.cell(nx, ny);
                            if neighbor.generation > 2
                                && access_allowed(neighbor, reg, params.combine_sense, rng)
                            {
                                let own = rng.next_word() & 0x8 != 0;
                                let src = if own { pond.cell(x, y) } else { pond.cell(nx, ny) };
                                reg = src.genome[io_ptr];
                            } else {
                                reg = pond.cell(x, y).genome[io_ptr];
                            }
                        } else {
                            reg = me.genome[io_ptr];
                        }
                    }
                    OP_XCHG => {
                        // Treat the next codon as an operand: swap it with
                        // the register.
                        inst_ptr += 1;
                        if inst_ptr >= depth {
                            inst_ptr = params.exec_start;
                        }
                        let cell = pond.cell_mut(x, y);
                        let tmp = reg;
                        reg = cell.genome[inst_ptr];
                        cell.genome[inst_ptr] = tmp & INST_MASK;
                    }
                    OP_KILL => {
                        let facing = pond.cell(x, y).facing;
                        let (nx, ny) = params.topology.neighbor(width, height, x, y, facing);
                        if access_allowed(pond.cell(nx, ny), reg, Sense::Negative, rng) {
                            if pond.cell(nx, ny).is_viable() {
                                counters.viable_cells_killed += 1;
                            }
                            let id = next_cell_id(cell_id_counter);
                            let victim = pond.cell_mut(nx, ny);
                            victim.genome.fill(OP_STOP);
                            victim.id = id;
                            victim.parent_id = 0;
                            victim.lineage = id;
                            victim.generation = 0;
                            victim.logo = 0;
                            victim.facing = 0;
                        } else if pond.cell(nx, ny).is_viable() {
                            // Failed kills on viable cells cost a fraction
                            // of our own energy.
                            let me = pond.cell_mut(x, y);
                            let penalty = me.energy / params.failed_kill_penalty;
                            me.energy -= penalty;
                        }
                    }
                    OP_SHARE => {
                        let facing = pond.cell(x, y).facing;
                        let (nx, ny) = params.topology.neighbor(width, height, x, y, facing);
                        if access_allowed(pond.cell(nx, ny), reg, Sense::Positive, rng) {
                            let (me, neighbor) = pond.pair_mut((x, y), (nx, ny));
                            if neighbor.is_viable() {
                                counters.viable_cell_shares += 1;
                            }
                            // Integer split; we keep the odd unit.
                            let total = me.energy + neighbor.energy;
                            neighbor.energy = total / 2;
                            me.energy = total - neighbor.energy;
                        }
                    }
                    OP_ZERO => reg = 0,
                    OP_SETP => io_ptr = reg as usize % depth,
                    OP_NEXTB => mem_ptr = mem_ptr.wrapping_add(8) & MEM_MASK,
                    OP_PREVB => mem_ptr = mem_ptr.wrapping_sub(8) & MEM_MASK,
                    OP_NEXTM => mem_ptr = mem_ptr.wrapping_add(1) & MEM_MASK,
                    OP_PREVM => mem_ptr = mem_ptr.wrapping_sub(1) & MEM_MASK,
                    OP_READM => {
                        reg = read_mem(pond, params.topology, counters, x, y, mem_ptr);
                    }
                    OP_WRITEM => {
                        write_mem(pond, params.topology, counters, rng, x, y, mem_ptr, reg);
                    }
                    OP_CLEARM => pond.cell_mut(x, y).ram = [0; RAM_SIZE],
                    OP_ADD => {
                        reg = reg
                            .wrapping_add(read_mem(pond, params.topology, counters, x, y, mem_ptr));
                    }
                    OP_SUB => {
                        reg = reg
                            .wrapping_sub(read_mem(pond, params.topology, counters, x, y, mem_ptr));
                    }
                    OP_MUL => {
                        reg = reg
                            .wrapping_mul(read_mem(pond, params.topology, counters, x, y, mem_ptr));
                    }
                    OP_DIV => {
                        // The zero test and the quotient each read the
                        // mapped slot; both accesses are counted.
                        let divisor = read_mem(pond, params.topology, counters, x, y, mem_ptr);
                        reg = if divisor != 0 {
                            reg / read_mem(pond, params.topology, counters, x, y, mem_ptr)
                        } else {
                            0
                        };
                    }
                    OP_SHL => reg <<= 1,
                    OP_SHR => reg >>= 1,
                    OP_SETMP => mem_ptr = reg & MEM_MASK,
                    OP_RAND => reg = rng.next_word() as u8,
                    _ => unreachable!("genome codons are masked to five bits"),
                }
            }

            inst_ptr += 1;
            if inst_ptr >= depth {
                inst_ptr = params.exec_start;
            }
        }

        let energy = pond.cell(x, y).energy;
        if energy == 0 {
            if params.decay_ram {
                let t = rng.next_word();
                pond.cell_mut(x, y).ram[((t >> 8) & RAM_MASK) as usize] = t as u8;
            }
        } else if energy >= params.reproduction_cost && self.output[0] != OP_STOP {
            // The output buffer holds a candidate offspring. There is no
            // point copying into a cell with no energy; it would never run
            // and would eventually be reseeded with random junk anyway.
            let facing = pond.cell(x, y).facing;
            let (nx, ny) = params.topology.neighbor(width, height, x, y, facing);
            if pond.cell(nx, ny).energy > 0
                && access_allowed(pond.cell(nx, ny), reg, Sense::Negative, rng)
            {
                let id = next_cell_id(cell_id_counter);
                let (me, offspring) = pond.pair_mut((x, y), (nx, ny));
                if offspring.is_viable() {
                    counters.viable_cells_replaced += 1;
                }
                offspring.id = id;
                offspring.parent_id = me.id;
                offspring.lineage = me.lineage;
                offspring.generation = me.generation + 1;
                offspring.logo = 0;
                offspring.facing = 0;
                offspring.genome.copy_from_slice(&self.output);
                if params.clear_ram {
                    offspring.ram = [0; RAM_SIZE];
                } else {
                    for byte in offspring.ram.iter_mut() {
                        *byte = rng.next_word() as u8;
                    }
                }
                me.energy -= params.reproduction_cost;
            }
        }
    }
}
