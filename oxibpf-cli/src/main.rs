//! Minimal demonstration binary for `oxibpf`. Not a product-grade CLI — a
//! thin wiring surface so a human (or CI with root) can exercise the
//! library's public API end to end: assemble, load, attach, stream.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oxibpf::arch::Arch;
use oxibpf::asm::{self, Stmt};
use oxibpf::elf::ElfObject;
use oxibpf::insn::{Insn, Reg};
use oxibpf::maps::{Map, MapSpec, MapType};
use oxibpf::prog::{Program, ProgSpec};
use oxibpf::ringbuf::RingBuf;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "oxibpf-cli")]
#[command(about = "Demonstration front-end for the oxibpf eBPF library")]
struct Cli {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Assemble the canned `mov r0, 2; exit` program and print its bytecode.
    AssembleDemo,

    /// Parse a prebuilt ELF object and print its sections, maps, and
    /// inferred program types.
    Inspect {
        /// Path to a 64-bit little-endian ET_REL object.
        file: PathBuf,
    },

    /// Load the named program section out of an ELF object and print the
    /// resulting program fd. Requires root and `CAP_BPF`.
    Load {
        file: PathBuf,
        #[arg(long)]
        section: String,
        #[arg(long, default_value = "GPL")]
        license: String,
    },

    /// Create a ring-buffer map and stream committed records to stdout as
    /// NDJSON `{"len": N, "data_hex": "..."}` lines until interrupted.
    StreamRingbuf {
        #[arg(long, default_value_t = 4)]
        pages: u32,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("OXIBPF_LOG", "info")).init();

    let cli = Cli::parse();
    match cli.action {
        Action::AssembleDemo => assemble_demo(),
        Action::Inspect { file } => inspect(&file),
        Action::Load { file, section, license } => load(&file, &section, &license),
        Action::StreamRingbuf { pages } => stream_ringbuf(pages),
    }
}

fn assemble_demo() -> Result<()> {
    let stream = vec![Stmt::Insn(Insn::mov64_imm(Reg::R0, 2)), Stmt::Insn(Insn::exit())];
    let insns = asm::assemble(&stream).context("assembling demo program")?;
    let bytecode = asm::to_bytecode(&insns);
    println!("{} bytes, {} instructions:", bytecode.len(), insns.len());
    println!("{}", hex_dump(&bytecode));
    Ok(())
}

fn inspect(file: &PathBuf) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let obj = ElfObject::parse(&data).context("parsing ELF object")?;
    println!("license: {}", obj.license);
    println!("kernel_version: {:#x}", obj.kernel_version);
    println!("programs:");
    for p in &obj.programs {
        println!("  {} type={:?} insns={}", p.name, p.prog_type, p.instructions.len() / oxibpf::insn::INSN_SIZE);
    }
    println!("maps:");
    for (name, def) in &obj.maps {
        println!(
            "  {name} type={} key_size={} value_size={} max_entries={}",
            def.map_type, def.key_size, def.value_size, def.max_entries
        );
    }
    println!("relocations: {}", obj.relocations.len());
    Ok(())
}

fn load(file: &PathBuf, section: &str, license: &str) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let obj = ElfObject::parse(&data).context("parsing ELF object")?;
    let prog_section =
        obj.programs.iter().find(|p| p.name == section).with_context(|| format!("no program section `{section}`"))?;

    let arch = Arch::detect().context("detecting CPU architecture")?;
    let spec = ProgSpec {
        prog_type: prog_section.prog_type,
        name: section.to_string(),
        license: license.to_string(),
        log_level: oxibpf::prog::LOG_LEVEL_VERBOSE,
    };
    let program = Program::load(&arch, spec, &prog_section.instructions).context("loading program")?;
    log::info!("loaded `{section}` as fd {}", program.fd());
    println!("{{\"fd\": {}}}", program.fd());
    Ok(())
}

fn stream_ringbuf(pages: u32) -> Result<()> {
    let arch = Arch::detect().context("detecting CPU architecture")?;
    let page_size = arch.page_size;
    let data_size = page_size * (pages.max(1) as usize).next_power_of_two();
    let spec = MapSpec::new(MapType::RingBuf, 0, 0, data_size as u32, "oxibpf_cli_rb");
    let map = Map::create(&arch, spec).context("creating ring buffer map")?;
    let rb = RingBuf::open(&arch, map.fd(), data_size).context("mapping ring buffer")?;

    println!("streaming ring buffer (ctrl-c to stop)...");
    loop {
        rb.poll_batch(|payload| {
            let line = serde_json::json!({ "len": payload.len(), "data_hex": hex_dump_compact(payload) });
            println!("{line}");
        })?;
        if !rb.wait(1000)? {
            continue;
        }
    }
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes.chunks(8).map(|chunk| chunk.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")).collect::<Vec<_>>().join("\n")
}

fn hex_dump_compact(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join("")
}
