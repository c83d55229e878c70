//! Lumen Engine Demo Viewer
//!
//! Ray traces a spinning cube above a ground plane with an orbiting camera.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p lumen-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--shaders <DIR>`: Directory with the compiled `.spv` ray tracing shaders
//! - `--frames-in-flight <N>`: Frames recorded ahead of the GPU (default: 2)
//! - `--vsync`: Enable vsync
//! - `--texture <PATH>`: Image used as the ground plane's base color
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use lumen_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let config = parse_config(
        AppConfig::new("Lumen Engine - Ray Tracing Demo").with_size(WIDTH, HEIGHT),
        std::env::args().skip(1),
    );
    run_app::<Viewer>(config)
}

/// Apply the window and frame flags. Unknown flags are left for the app.
fn parse_config(mut config: AppConfig, args: impl IntoIterator<Item = String>) -> AppConfig {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--shaders" => {
                if let Some(dir) = args.next() {
                    config = config.with_shader_dir(dir);
                }
            }
            "--frames-in-flight" => match args.next().map(|v| v.parse::<usize>()) {
                Some(Ok(n)) => config = config.with_frames_in_flight(n),
                Some(Err(e)) => eprintln!("ignoring --frames-in-flight: {e}"),
                None => {}
            },
            "--vsync" => config = config.with_vsync(true),
            _ => {}
        }
    }
    config
}

fn print_help() {
    eprintln!(
        "Lumen Engine Demo Viewer

USAGE:
    cargo run -p lumen-viewer -- [OPTIONS]

OPTIONS:
    --shaders <DIR>         Directory with raygen.rgen.spv, miss.rmiss.spv
                            and closest_hit.rchit.spv (default: shaders/spv)
    --frames-in-flight <N>  Frames recorded ahead of the GPU (default: 2)
    --vsync                 Enable vsync
    --texture <PATH>        Image used as the ground plane's base color
    -h, --help              Print this help message

CONTROLS:
    Space                   Pause or resume the animation

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_frame_and_shader_flags() {
        let config = parse_config(
            AppConfig::default(),
            args(&["--shaders", "out/spv", "--frames-in-flight", "3", "--vsync", "--texture", "a.png"]),
        );
        assert_eq!(config.shader_dir, std::path::PathBuf::from("out/spv"));
        assert_eq!(config.frames_in_flight, 3);
        assert!(config.vsync);
    }

    #[test]
    fn bad_frame_count_keeps_default() {
        let config = parse_config(AppConfig::default(), args(&["--frames-in-flight", "many"]));
        assert_eq!(config.frames_in_flight, AppConfig::default().frames_in_flight);
    }
}
