use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result};

use mote::demos::SourceLoader;
use mote::{Assembler, Cpu, Memory};

/// Mote is a complete & convenient toolchain for the Tiny16 virtual CPU.
#[derive(Parser)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a `.asm` file into a flat binary image
    Asm {
        /// Source file; bundled demo paths resolve without a filesystem
        name: PathBuf,
        /// Destination for the image
        #[arg(short, long, default_value = "a.bin")]
        out: PathBuf,
    },
    /// Execute a flat binary image
    Emu {
        /// Image file to execute
        image: PathBuf,
        /// Load address for the image
        #[arg(long, value_parser = parse_addr, default_value = "0x0000")]
        base: u16,
        /// Initial program counter
        #[arg(long, value_parser = parse_addr, default_value = "0x0000")]
        pc: u16,
        /// Dump an inclusive memory range after the run
        #[arg(long, num_args = 2, value_parser = parse_addr, value_names = ["LO", "HI"])]
        dump: Option<Vec<u16>>,
    },
    /// Assemble a `.asm` file and run it immediately
    Run {
        /// Source file to assemble and execute at address 0
        name: PathBuf,
        /// Dump an inclusive memory range after the run
        #[arg(long, num_args = 2, value_parser = parse_addr, value_names = ["LO", "HI"])]
        dump: Option<Vec<u16>>,
    },
    /// Assemble without running or writing an image
    Check {
        /// File to check
        name: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Asm { name, out } => {
            let bytes = assemble(&name)?;
            let mut file = File::create(&out).into_diagnostic()?;
            file.write_all(&bytes).into_diagnostic()?;
            println!(
                "{:>12} {} ({} bytes)",
                "Saved to".green().bold(),
                out.display(),
                bytes.len()
            );
            Ok(())
        }
        Command::Emu {
            image,
            base,
            pc,
            dump,
        } => {
            let bytes = fs::read(&image).into_diagnostic()?;
            println!("{:>12} image {}", "Running".green().bold(), image.display());
            execute(&bytes, base, pc, dump)
        }
        Command::Run { name, dump } => {
            let bytes = assemble(&name)?;
            println!("{:>12} binary", "Running".green().bold());
            execute(&bytes, 0x0000, 0x0000, dump)
        }
        Command::Check { name } => {
            assemble(&name)?;
            println!("{:>12} with 0 errors", "Finished".green().bold());
            Ok(())
        }
    }
}

fn assemble(name: &Path) -> Result<Vec<u8>> {
    let loader = SourceLoader::new();
    let src = loader.read(name)?;
    println!(
        "{:>12} target {}",
        "Assembling".green().bold(),
        name.display()
    );
    Assembler::new(&src).assemble()
}

fn execute(image: &[u8], base: u16, pc: u16, dump: Option<Vec<u16>>) -> Result<()> {
    let mut mem = Memory::new();
    mem.load_image(image, base);
    let mut cpu = Cpu::new();
    cpu.set_pc(pc);
    cpu.run(&mut mem)?;
    if let Some(range) = dump {
        dump_memory(&mem, range[0], range[1]);
    }
    Ok(())
}

/// 16 bytes per row, inclusive range.
fn dump_memory(mem: &Memory, lo: u16, hi: u16) {
    let mut addr = lo as u32;
    while addr <= hi as u32 {
        print!("{addr:04x}: ");
        for i in 0..16 {
            if addr + i <= hi as u32 {
                print!("{:02x} ", mem.read8((addr + i) as u16));
            }
        }
        println!();
        addr += 16;
    }
}

fn parse_addr(s: &str) -> Result<u16, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    match parsed {
        Ok(val) if val <= 0xFFFF => Ok(val as u16),
        Ok(_) => Err(format!("`{s}` does not fit in 16 bits")),
        Err(err) => Err(err.to_string()),
    }
}
