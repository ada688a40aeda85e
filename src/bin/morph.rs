//! Headless pipeline: decode an image, solve an assignment against itself
//! or a custom target, then simulate the morph and write numbered PNG
//! frames.
//!
//! Usage: cargo run --release --bin morph -- --input photo.png [OPTIONS]
//!
//! Options:
//!   --input <PATH>        Source image (required)
//!   --target <PATH>       Optional target image (default: source itself)
//!   --algorithm <NAME>    genetic, optimal, auction, hybrid (default: genetic)
//!   --sidelen <N>         Optimizer resolution, multiple of 64 (default: 64)
//!   --resolution <N>      Render resolution (default: 512)
//!   --frames <N>          Frames to simulate (default: 240)
//!   --every <N>           Write every Nth frame (default: 2)
//!   --out <DIR>           Output directory (default: ./frames)
//!   --save-preset         Also save the solved preset under ./presets

use std::path::PathBuf;

use pixmorph::MorphApp;
use pixmorph::app::calculate::util::{Algorithm, CustomTarget, GenerationSettings};
use pixmorph::app::preset::UnprocessedPreset;
use pixmorph::app::calculate::ProgressMsg;

fn load_image(path: &str) -> Option<UnprocessedPreset> {
    let img = image::open(path).ok()?.to_rgb8();
    let name = PathBuf::from(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".to_string());
    Some(UnprocessedPreset {
        name,
        width: img.width(),
        height: img.height(),
        source_img: img.into_raw(),
    })
}

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();

    let mut input: Option<String> = None;
    let mut target: Option<String> = None;
    let mut algorithm = Algorithm::Genetic;
    let mut sidelen: u32 = 64;
    let mut resolution: u32 = 512;
    let mut frames: u32 = 240;
    let mut every: u32 = 2;
    let mut out_dir = "frames".to_string();
    let mut save_preset = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" | "-i" => {
                if i + 1 < args.len() {
                    input = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--target" | "-t" => {
                if i + 1 < args.len() {
                    target = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--algorithm" | "-a" => {
                if i + 1 < args.len() {
                    algorithm = match args[i + 1].to_lowercase().as_str() {
                        "genetic" => Algorithm::Genetic,
                        "optimal" => Algorithm::Optimal,
                        "auction" => Algorithm::Auction,
                        "hybrid" => Algorithm::Hybrid,
                        other => {
                            eprintln!("Unknown algorithm: {}", other);
                            return;
                        }
                    };
                    i += 1;
                }
            }
            "--sidelen" | "-s" => {
                if i + 1 < args.len() {
                    sidelen = args[i + 1].parse().unwrap_or(64);
                    i += 1;
                }
            }
            "--resolution" | "-r" => {
                if i + 1 < args.len() {
                    resolution = args[i + 1].parse().unwrap_or(512);
                    i += 1;
                }
            }
            "--frames" | "-f" => {
                if i + 1 < args.len() {
                    frames = args[i + 1].parse().unwrap_or(240);
                    i += 1;
                }
            }
            "--every" | "-e" => {
                if i + 1 < args.len() {
                    every = args[i + 1].parse().unwrap_or(2).max(1);
                    i += 1;
                }
            }
            "--out" | "-o" => {
                if i + 1 < args.len() {
                    out_dir = args[i + 1].clone();
                    i += 1;
                }
            }
            "--save-preset" => {
                save_preset = true;
            }
            "--help" | "-h" => {
                println!("Headless morph pipeline");
                println!();
                println!("Usage: morph --input photo.png [OPTIONS]");
                println!("See the module docs for the option list.");
                return;
            }
            _ => {}
        }
        i += 1;
    }

    let Some(input) = input else {
        eprintln!("--input is required");
        return;
    };
    let Some(source) = load_image(&input) else {
        eprintln!("Failed to decode {}", input);
        return;
    };

    let mut settings =
        GenerationSettings::default(uuid::Uuid::new_v4(), source.name.clone());
    settings.algorithm = algorithm;
    settings.sidelen = sidelen;
    if let Some(target_path) = &target {
        let Some(image) = load_image(target_path) else {
            eprintln!("Failed to decode {}", target_path);
            return;
        };
        settings.custom_target = Some(CustomTarget {
            image,
            weights: None,
        });
    }
    if let Err(err) = settings.validate() {
        eprintln!("Bad settings: {}", err);
        return;
    }

    // Solve on this thread, narrating progress.
    println!("solving {}x{} with {:?}...", sidelen, sidelen, algorithm);
    let mut solved = None;
    {
        let mut last_percent = -1i32;
        let mut sink = |msg: ProgressMsg| match msg {
            ProgressMsg::Progress { value } => {
                let percent = (value * 100.0) as i32;
                if percent > last_percent {
                    last_percent = percent;
                    print!("\r{:3}%", percent);
                    std::io::Write::flush(&mut std::io::stdout()).ok();
                }
            }
            ProgressMsg::Done { preset } => solved = Some(preset),
            ProgressMsg::Error { message } => eprintln!("\nsolver error: {}", message),
            _ => {}
        };
        let cancel = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        if let Err(err) =
            pixmorph::app::calculate::process(source, settings, &mut sink, cancel)
        {
            eprintln!("solver failed: {}", err);
            return;
        }
    }
    println!();

    let Some(preset) = solved else {
        eprintln!("solver produced no result");
        return;
    };

    if save_preset {
        match preset.save_under(std::path::Path::new("presets")) {
            Ok(dir) => println!("preset saved to {}", dir.display()),
            Err(err) => eprintln!("could not save preset: {}", err),
        }
    }

    if let Err(err) = std::fs::create_dir_all(&out_dir) {
        eprintln!("could not create {}: {}", out_dir, err);
        return;
    }

    let mut app = match MorphApp::with_resolution(vec![preset], resolution) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("could not build the simulation: {}", err);
            return;
        }
    };

    let mut written = 0u32;
    for frame in 0..frames {
        app.advance_frame();
        if frame % every != 0 {
            continue;
        }
        let (w, h) = app.size();
        let Some(img) = image::RgbaImage::from_raw(w, h, app.frame().to_vec()) else {
            eprintln!("frame buffer has unexpected size");
            return;
        };
        let path = format!("{}/frame_{:04}.png", out_dir, written);
        if let Err(err) = img.save(&path) {
            eprintln!("could not write {}: {}", path, err);
            return;
        }
        written += 1;
    }
    println!("{} frames written to {}", written, out_dir);
}
