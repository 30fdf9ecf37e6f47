use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use famicore::nes::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP, Nes,
};
use sha1::{Digest, Sha1};

#[derive(Debug, Clone)]
struct Config {
    rom: PathBuf,
    frames: u32,
    hold: u8,
    hold_frames: Option<u32>,
    cycles: Option<u32>,
    progress_every: u32,
    print_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rom: PathBuf::new(),
            frames: 60,
            hold: 0,
            hold_frames: None,
            cycles: None,
            progress_every: 60,
            print_events: false,
        }
    }
}

fn parse_buttons(list: &str) -> Result<u8> {
    let mut state = 0u8;
    for token in list.split(',') {
        state |= match token.trim().to_ascii_lowercase().as_str() {
            "a" => BUTTON_A,
            "b" => BUTTON_B,
            "select" => BUTTON_SELECT,
            "start" => BUTTON_START,
            "up" => BUTTON_UP,
            "down" => BUTTON_DOWN,
            "left" => BUTTON_LEFT,
            "right" => BUTTON_RIGHT,
            other => anyhow::bail!("unknown button: {other}"),
        };
    }
    Ok(state)
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rom" => {
                let value = args
                    .next()
                    .context("--rom requires a path, e.g. --rom games/smb.nes")?;
                cfg.rom = PathBuf::from(value);
            }
            "--frames" => {
                let value = args
                    .next()
                    .context("--frames requires an integer, e.g. --frames 600")?;
                cfg.frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frames value: {value}"))?;
            }
            "--hold" => {
                let value = args
                    .next()
                    .context("--hold requires a button list, e.g. --hold start,a")?;
                cfg.hold = parse_buttons(&value)?;
            }
            "--hold-frames" => {
                let value = args
                    .next()
                    .context("--hold-frames requires an integer, e.g. --hold-frames 30")?;
                cfg.hold_frames = Some(
                    value
                        .parse::<u32>()
                        .with_context(|| format!("invalid --hold-frames value: {value}"))?,
                );
            }
            "--cycles" => {
                let value = args
                    .next()
                    .context("--cycles requires an integer, e.g. --cycles 1789773")?;
                cfg.cycles = Some(
                    value
                        .parse::<u32>()
                        .with_context(|| format!("invalid --cycles value: {value}"))?,
                );
            }
            "--progress" => {
                let value = args
                    .next()
                    .context("--progress requires an integer, e.g. --progress 120")?;
                cfg.progress_every = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --progress value: {value}"))?;
            }
            "--events" => cfg.print_events = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    if cfg.rom.as_os_str().is_empty() {
        anyhow::bail!("--rom is required\nUse --help to view supported options.");
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "Headless ROM runner for famicore\n\n\
Usage:\n\
  cargo run --bin famicore_run -- --rom <path> [options]\n\n\
Options:\n\
  --rom <path>          Path to an iNES ROM image (required)\n\
  --frames <n>          Number of frames to run (default 60)\n\
  --hold <buttons>      Hold controller 1 buttons: a,b,select,start,up,down,left,right\n\
  --hold-frames <n>     Release the held buttons after n frames (default: whole run)\n\
  --cycles <n>          Run a raw CPU cycle budget instead of frames\n\
  --progress <n>        Print a progress line every n frames (default 60, 0 disables)\n\
  --events              Print recent emulator events after the run\n\
  -h, --help            Show this help\n"
    );
}

fn hash_frame(frame_rgba: &[u8]) -> String {
    let digest = Sha1::digest(frame_rgba);
    BASE64_STANDARD.encode(digest)
}

fn main() -> Result<()> {
    let cfg = parse_args()?;
    let start = Instant::now();

    let mut nes = Nes::new();
    nes.load_rom_from_path(&cfg.rom)
        .with_context(|| format!("failed to load ROM {}", cfg.rom.display()))?;
    println!("Loaded {} [{}]", cfg.rom.display(), nes.mapper_name());

    if let Some(budget) = cfg.cycles {
        let consumed = nes.run_cycles(budget);
        println!("cycle budget {budget} -> consumed {consumed}");
    } else {
        let hold_until = cfg.hold_frames.unwrap_or(cfg.frames);
        for frame in 0..cfg.frames {
            let held = if frame < hold_until { cfg.hold } else { 0 };
            nes.set_controller_state(held);
            nes.run_frame();

            let done = frame + 1;
            if cfg.progress_every != 0 && done % cfg.progress_every == 0 && done != cfg.frames {
                println!(
                    "frame {done}/{} hash {}",
                    cfg.frames,
                    hash_frame(nes.frame_buffer())
                );
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f32();
    println!();
    println!("Summary:");
    println!("- Mapper: {}", nes.mapper_name());
    println!("- Frames: {}", nes.frame_count());
    println!("- Instructions: {}", nes.debug_instruction_count());
    println!("- CPU cycles: {}", nes.debug_total_cycles());
    println!("- Frame hash: {}", hash_frame(nes.frame_buffer()));
    println!("- Runtime: {:.2}s", elapsed);

    if cfg.print_events {
        println!();
        println!("Recent events:");
        for event in nes.debug_recent_events(16) {
            println!("- {event}");
        }
    }

    Ok(())
}
