use std::path::PathBuf;
use std::process::exit;
use clap::Parser;
use tracing::{error, info};

use r_mips::core::config::MachineConfig;
use r_mips::core::cpu::disassembler;
use r_mips::core::machine::Machine;

pub const EMU_NAME: &str = "r-mips";
pub const EMU_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = EMU_NAME, about = "MIPS machine emulator core")]
struct Args {
    /// Machine description (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Raw kernel/firmware image to load into physical memory
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Physical load address of the image
    #[arg(long, default_value_t = 0x1fc0_0000, value_parser = parse_u64)]
    load_address: u64,

    /// Entry point; defaults to the machine description's initial pc
    #[arg(long, value_parser = parse_u64)]
    entry: Option<u64>,

    /// Number of guest instructions to run
    #[arg(short = 'n', long, default_value_t = u64::MAX)]
    steps: u64,

    /// Disable the dynamic translation engine
    #[arg(long)]
    no_dyntrans: bool,

    /// Log filter (overrides the machine description)
    #[arg(long)]
    log: Option<String>,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())
    }
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match MachineConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("cannot load machine description: {}", e);
                exit(1);
            }
        },
        None => MachineConfig::default(),
    };
    if args.no_dyntrans {
        config.dyntrans.enabled = false;
    }

    if let Err(e) = r_mips::log::init(args.log.as_deref().unwrap_or(&config.log)) {
        eprintln!("cannot initialise logging: {}", e);
        exit(1);
    }
    info!("Welcome to {} v{}", EMU_NAME, EMU_VERSION);

    let mut machine = match Machine::new(&config) {
        Ok(machine) => machine,
        Err(e) => {
            error!("machine setup failed: {}", e);
            exit(1);
        }
    };

    if let Some(path) = &args.image {
        match std::fs::read(path) {
            Ok(image) => {
                info!(
                    "loading {} ({} bytes) at paddr {:#x}",
                    path.display(),
                    image.len(),
                    args.load_address
                );
                machine.load_raw_image(args.load_address, &image);
            }
            Err(e) => {
                error!("cannot read image {}: {}", path.display(), e);
                exit(1);
            }
        }
    }

    if let Some(entry) = args.entry {
        machine.cpu_set_pc(0, entry);
    }

    let (executed, reason) = machine.run(args.steps);
    info!("executed {} instructions, stop reason: {:?}", executed, reason);

    dump_cpu_state(&machine);
}

fn dump_cpu_state(machine: &Machine) {
    let cpu = machine.cpu(0);
    println!("pc = {:016x}", cpu.get_pc());
    println!("hi = {:016x}  lo = {:016x}", cpu.get_hi(), cpu.get_lo());
    let regs = cpu.get_registers();
    for row in 0..8 {
        let mut line = String::new();
        for col in 0..4 {
            let r = row * 4 + col;
            line.push_str(&format!(
                "{:>5} = {:016x}  ",
                disassembler::register_alias(r),
                regs[r]
            ));
        }
        println!("{}", line.trim_end());
    }
}
