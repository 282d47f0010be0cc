mod dump;
mod mt19937;
mod pond;
mod render;
mod simulation;
mod stats;
mod topology;
mod vm;

use std::env;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use render::ColorScheme;
use simulation::{ConsoleSink, FrameOutput, Params, Simulation};
use stats::StatsWriter;
use topology::Neighborhood;
use vm::Sense;

/// Simulation configuration (can be loaded from YAML).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Grid dimensions and genome depth
    pub pond: PondConfig,
    /// Energy inflow and costs
    pub energy: EnergyConfig,
    /// Seed, mutation and execution settings
    pub simulation: SimConfig,
    /// Report, dump and refresh cadence
    pub reporting: ReportingConfig,
    /// Frame output settings
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PondConfig {
    pub width: usize,
    pub height: usize,
    /// Genome length in codons; must be a multiple of 16.
    pub depth: usize,
    /// Neighbor count: 4, 6 or 8.
    pub directions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// Seed a random cell every N ticks.
    pub inflow_frequency: u64,
    pub inflow_rate_base: u64,
    /// Extra energy per seeding, uniform below this. Null for none.
    pub inflow_rate_variation: Option<u64>,
    /// Stop adding inflow energy when the pond total exceeds this.
    pub total_energy_cap: Option<u64>,
    /// Stop adding inflow energy to cells above this.
    pub cell_energy_cap: Option<u64>,
    /// Divisor for the energy penalty charged on failed kills.
    pub failed_kill_penalty: u64,
    pub reproduction_cost: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Null seeds from the wall clock.
    pub seed: Option<u32>,
    /// Per-instruction mutation probability out of 2^32.
    pub mutation_rate: u32,
    /// Tick to stop at. Null runs forever.
    pub stop_at: Option<u64>,
    /// Genome index where execution starts and wraps back to.
    pub exec_start_inst: usize,
    /// Permission sense for genome combination: 0 or 1.
    pub combine_sense: u8,
    /// Zero fresh RAM instead of randomizing it.
    pub clear_ram: bool,
    /// Scramble one RAM byte when a cell ends a tick with no energy.
    pub decay_ram: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub report_frequency: u64,
    /// Dump viable genomes every N ticks. Null disables dumps.
    pub dump_frequency: Option<u64>,
    pub refresh_frequency: u64,
    pub dump_dir: String,
    /// CSV report destination. Null writes to stdout.
    pub stats_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Write a PPM frame at every refresh boundary.
    pub render_frames: bool,
    pub frames_dir: String,
    /// kinship, lineage, logo, facing, energy1, energy2, ram0 or ram1.
    pub color_scheme: String,
}

impl Default for PondConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            depth: 512,
            directions: 6,
        }
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            inflow_frequency: 100,
            inflow_rate_base: 2000,
            inflow_rate_variation: Some(4000),
            total_energy_cap: None,
            cell_energy_cap: Some(10_000),
            failed_kill_penalty: 3,
            reproduction_cost: 20,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: None,
            mutation_rate: 100_000,
            stop_at: None,
            exec_start_inst: 0,
            combine_sense: 0,
            clear_ram: false,
            decay_ram: false,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            report_frequency: 1_000_000,
            dump_frequency: Some(10_000_000),
            refresh_frequency: 20_000,
            dump_dir: ".".to_string(),
            stats_file: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            render_frames: false,
            frames_dir: "frames".to_string(),
            color_scheme: "kinship".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pond: PondConfig::default(),
            energy: EnergyConfig::default(),
            simulation: SimConfig::default(),
            reporting: ReportingConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a YAML file.
    pub fn from_yaml(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to a YAML file.
    pub fn to_yaml(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Generate a template config file.
    pub fn write_template(path: &str) -> Result<(), Box<dyn std::error::Error>> {
        Config::default().to_yaml(path)
    }

    /// Validate configuration. Returns warnings, or a fatal error.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.pond.width < 2 || self.pond.height < 2 {
            return Err("pond dimensions must be at least 2x2".to_string());
        }
        if self.pond.depth == 0 || self.pond.depth % 16 != 0 {
            return Err(format!(
                "pond depth {} must be a nonzero multiple of 16",
                self.pond.depth
            ));
        }
        if Neighborhood::from_directions(self.pond.directions).is_none() {
            return Err(format!(
                "directions must be 4, 6 or 8, got {}",
                self.pond.directions
            ));
        }
        if Sense::from_flag(self.simulation.combine_sense).is_none() {
            return Err(format!(
                "combine_sense must be 0 or 1, got {}",
                self.simulation.combine_sense
            ));
        }
        if self.simulation.exec_start_inst >= self.pond.depth {
            return Err(format!(
                "exec_start_inst {} is outside the genome (depth {})",
                self.simulation.exec_start_inst, self.pond.depth
            ));
        }
        if self.energy.failed_kill_penalty == 0 {
            return Err("failed_kill_penalty must be nonzero".to_string());
        }
        if ColorScheme::from_name(&self.output.color_scheme).is_none() {
            return Err(format!(
                "unknown color scheme \"{}\"",
                self.output.color_scheme
            ));
        }

        if self.simulation.mutation_rate == 0 {
            warnings.push("mutation_rate is 0; nothing will ever mutate".to_string());
        }
        if self.reporting.report_frequency == 0 {
            warnings.push("report_frequency is 0; statistics reporting disabled".to_string());
        }
        if self.energy.inflow_frequency == 0 {
            warnings.push("inflow_frequency is 0; no energy will ever enter the pond".to_string());
        }

        Ok(warnings)
    }

    /// Flatten into runtime parameters, resolving the seed.
    pub fn params(&self) -> Params {
        let seed = self.simulation.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(1)
        });
        Params {
            width: self.pond.width,
            height: self.pond.height,
            depth: self.pond.depth,
            topology: Neighborhood::from_directions(self.pond.directions)
                .unwrap_or(Neighborhood::Six),
            seed,
            mutation_rate: self.simulation.mutation_rate,
            inflow_frequency: self.energy.inflow_frequency,
            inflow_rate_base: self.energy.inflow_rate_base,
            inflow_rate_variation: self.energy.inflow_rate_variation,
            total_energy_cap: self.energy.total_energy_cap,
            cell_energy_cap: self.energy.cell_energy_cap,
            failed_kill_penalty: self.energy.failed_kill_penalty,
            reproduction_cost: self.energy.reproduction_cost,
            report_frequency: self.reporting.report_frequency,
            dump_frequency: self.reporting.dump_frequency,
            refresh_frequency: self.reporting.refresh_frequency,
            stop_at: self.simulation.stop_at,
            exec_start: self.simulation.exec_start_inst,
            combine_sense: Sense::from_flag(self.simulation.combine_sense)
                .unwrap_or(Sense::Negative),
            clear_ram: self.simulation.clear_ram,
            decay_ram: self.simulation.decay_ram,
        }
    }
}

fn parse_args() -> Config {
    let mut config = Config::default();
    let argv: Vec<String> = env::args().collect();

    // First pass: load a config file or generate a template.
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let path = &argv[i];
                match Config::from_yaml(path) {
                    Ok(loaded) => {
                        eprintln!("[INFO] Loaded config from {path}");
                        config = loaded;
                    }
                    Err(err) => {
                        eprintln!("Error loading config file '{path}': {err}");
                        std::process::exit(1);
                    }
                }
            }
            "--generate-config" => {
                i += 1;
                let path = if i < argv.len() && !argv[i].starts_with('-') {
                    argv[i].clone()
                } else {
                    "nanopond.yaml".to_string()
                };
                match Config::write_template(&path) {
                    Ok(()) => {
                        println!("Generated config template: {path}");
                        std::process::exit(0);
                    }
                    Err(err) => {
                        eprintln!("Error writing config template: {err}");
                        std::process::exit(1);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    // Second pass: CLI flags override config file values.
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1; // already processed
            }
            "--width" | "-w" => {
                i += 1;
                config.pond.width = argv[i].parse().expect("Invalid width");
            }
            "--height" | "-h" => {
                i += 1;
                config.pond.height = argv[i].parse().expect("Invalid height");
            }
            "--depth" => {
                i += 1;
                config.pond.depth = argv[i].parse().expect("Invalid depth");
            }
            "--directions" => {
                i += 1;
                config.pond.directions = argv[i].parse().expect("Invalid directions");
            }
            "--seed" | "-s" => {
                i += 1;
                config.simulation.seed = Some(argv[i].parse().expect("Invalid seed"));
            }
            "--mutation-rate" | "-m" => {
                i += 1;
                config.simulation.mutation_rate =
                    argv[i].parse().expect("Invalid mutation-rate");
            }
            "--stop-at" => {
                i += 1;
                config.simulation.stop_at = Some(argv[i].parse().expect("Invalid stop-at"));
            }
            "--inflow-frequency" => {
                i += 1;
                config.energy.inflow_frequency =
                    argv[i].parse().expect("Invalid inflow-frequency");
            }
            "--report-frequency" => {
                i += 1;
                config.reporting.report_frequency =
                    argv[i].parse().expect("Invalid report-frequency");
            }
            "--dump-frequency" => {
                i += 1;
                config.reporting.dump_frequency =
                    Some(argv[i].parse().expect("Invalid dump-frequency"));
            }
            "--no-dumps" => {
                config.reporting.dump_frequency = None;
            }
            "--refresh-frequency" => {
                i += 1;
                config.reporting.refresh_frequency =
                    argv[i].parse().expect("Invalid refresh-frequency");
            }
            "--dump-dir" => {
                i += 1;
                config.reporting.dump_dir = argv[i].clone();
            }
            "--stats-file" => {
                i += 1;
                config.reporting.stats_file = Some(argv[i].clone());
            }
            "--render-frames" => {
                config.output.render_frames = true;
            }
            "--no-render-frames" => {
                config.output.render_frames = false;
            }
            "--frames-dir" | "-d" => {
                i += 1;
                config.output.frames_dir = argv[i].clone();
            }
            "--color-scheme" => {
                i += 1;
                config.output.color_scheme = argv[i].clone();
            }
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_help() {
    println!("nanopond - a teeny tiny artificial life virtual machine");
    println!();
    println!("USAGE:");
    println!("    nanopond [OPTIONS]");
    println!("    nanopond --config pond.yaml");
    println!("    nanopond --generate-config [output.yaml]");
    println!();
    println!("CONFIG FILE:");
    println!("    -c, --config <FILE>        Load settings from YAML config file");
    println!("    --generate-config [FILE]   Generate template config (default: nanopond.yaml)");
    println!();
    println!("OPTIONS (override config file values):");
    println!("    -w, --width <N>            Pond width (default: 640)");
    println!("    -h, --height <N>           Pond height (default: 480)");
    println!("    --depth <N>                Genome depth, multiple of 16 (default: 512)");
    println!("    --directions <N>           Neighbors per cell: 4, 6 or 8 (default: 6)");
    println!("    -s, --seed <N>             Random seed (default: wall clock)");
    println!("    -m, --mutation-rate <N>    Mutation probability out of 2^32 (default: 100000)");
    println!("    --stop-at <N>              Stop after N ticks (default: run forever)");
    println!("    --inflow-frequency <N>     Seed a random cell every N ticks (default: 100)");
    println!("    --report-frequency <N>     CSV report every N ticks (default: 1000000)");
    println!("    --dump-frequency <N>       Genome dump every N ticks (default: 10000000)");
    println!("    --no-dumps                 Disable genome dumps");
    println!("    --refresh-frequency <N>    Frame refresh every N ticks (default: 20000)");
    println!("    --dump-dir <PATH>          Directory for dump files (default: .)");
    println!("    --stats-file <PATH>        Write CSV reports here instead of stdout");
    println!("    --render-frames            Write a PPM frame at every refresh");
    println!("    --frames-dir <PATH>        Frames output directory (default: frames)");
    println!("    --color-scheme <NAME>      kinship, lineage, logo, facing, energy1,");
    println!("                               energy2, ram0 or ram1 (default: kinship)");
}

fn main() {
    let config = parse_args();

    match config.validate() {
        Ok(warnings) => {
            for warning in warnings {
                eprintln!("Config warning: {warning}");
            }
        }
        Err(err) => {
            eprintln!("Config validation error: {err}");
            std::process::exit(1);
        }
    }

    let params = config.params();
    eprintln!(
        "[INFO] Starting pond: {}x{} cells, depth {}, {} directions, seed {}",
        params.width,
        params.height,
        params.depth,
        params.topology.directions(),
        params.seed
    );

    let stats = match &config.reporting.stats_file {
        Some(path) => match StatsWriter::to_file(path) {
            Ok(writer) => writer,
            Err(err) => {
                eprintln!("Error opening stats file '{path}': {err}");
                std::process::exit(1);
            }
        },
        None => StatsWriter::stdout(),
    };

    // Frame output stands in for a live display; failing to set it up is
    // fatal, same as a display init failure would be.
    let frames = if config.output.render_frames {
        let dir = PathBuf::from(&config.output.frames_dir);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            eprintln!(
                "*** Unable to create frames directory {}: {err} ***",
                dir.display()
            );
            std::process::exit(1);
        }
        let scheme = ColorScheme::from_name(&config.output.color_scheme)
            .unwrap_or(ColorScheme::Kinship);
        Some(FrameOutput {
            dir,
            scheme,
            frame: vec![0; params.width * params.height],
        })
    } else {
        None
    };

    let mut sink = ConsoleSink {
        stats,
        dump_dir: PathBuf::from(&config.reporting.dump_dir),
        frames,
    };

    let mut sim = Simulation::new(params);
    sim.run(&mut sink);
}
