//! Genome dump files.
//!
//! Every dump boundary writes `<clock>.dump.csv` containing one line per
//! viable replicator. Genomes print as codon characters with runs of STOP
//! abbreviated, which keeps dumps of sparse ponds small.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::pond::{Cell, Pond};
use crate::vm::{INST_MASK, NUM_INST, OP_STOP};

/// One printable character per opcode value.
pub const INST_CHARS: &[u8; NUM_INST] = b"0123456789abcdefghijklmnopqrstuv";

pub fn inst_char(inst: u8) -> char {
    INST_CHARS[(inst & INST_MASK) as usize] as char
}

/// Write one cell as a CSV line: identity fields, then the genome. The
/// first STOP of a run prints its character, the second through fourth
/// print '.', the rest of the run is omitted.
pub fn write_cell<W: Write>(out: &mut W, cell: &Cell) -> io::Result<()> {
    write!(
        out,
        "{},{},{},{},{},{},",
        cell.id,
        cell.parent_id,
        cell.lineage,
        cell.generation,
        inst_char(cell.logo),
        inst_char(cell.facing),
    )?;
    let mut stop_count = 0u32;
    for &inst in &cell.genome {
        if inst == OP_STOP {
            stop_count += 1;
        } else {
            stop_count = 0;
        }
        if stop_count < 5 {
            if stop_count > 1 {
                write!(out, ".")?;
            } else {
                write!(out, "{}", inst_char(inst))?;
            }
        }
    }
    writeln!(out)
}

/// Dump all viable cells to `<clock>.dump.csv` under `dir`. A file that
/// cannot be opened is reported on stderr and the simulation carries on.
pub fn dump_viable(pond: &Pond, clock: u64, dir: &Path) {
    let path = dir.join(format!("{clock}.dump.csv"));
    let file = match File::create(&path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!(
                "[WARNING] Could not open {} for writing: {err}",
                path.display()
            );
            return;
        }
    };
    eprintln!("[INFO] Dumping viable cells to {}", path.display());

    let mut out = BufWriter::new(file);
    for cell in pond.sweep() {
        if cell.energy > 0 && cell.is_viable() {
            let _ = write_cell(&mut out, cell);
        }
    }
    let _ = out.flush();
}
