//! Umbra demo viewer.
//!
//! Renders a procedural scene lit by an animated sun with virtual shadow
//! maps: a stack of sparse clipmap levels whose pages are bound only where
//! the camera sees them.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p umbra-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--first-width <W>`: World half-width of clipmap level 0 (default: 4.0)
//! - `--lod-bias <B>`: Level selection bias (default: -2.0)
//! - `--debug <MODE>`: Start in a debug view (`lit`, `shadow-factor`,
//!   `clipmap-level`, `page-residency`)
//! - `--sun-speed <R>`: Sun rotation in radians per second (default: 0.05)
//! - `--vsync`: Present with FIFO instead of the lowest-latency mode
//! - `--fps <N>`: Cap the frame rate
//! - `--frames-in-flight <N>`: Number of frame slots (default: 2)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `UMBRA_VALIDATION`: `1` or `0` to force Vulkan validation on or off

mod app;
mod controls;
mod scene;

use umbra_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1600;
const HEIGHT: u32 = 900;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let mut config = app_config(std::env::args().skip(1));
    if let Some(validation) = validation_override(std::env::var("UMBRA_VALIDATION").ok().as_deref()) {
        config = config.with_validation(validation);
    }

    run_app::<Viewer>(config)
}

/// Window and frame pacing options. Anything else is left to the viewer.
fn app_config(args: impl IntoIterator<Item = String>) -> AppConfig {
    let mut config = AppConfig::new("Umbra - Virtual Shadow Maps").with_size(WIDTH, HEIGHT);
    let mut args = args.into_iter().peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--vsync" => config = config.with_vsync(true),
            "--fps" => {
                if let Some(Ok(fps)) = args.peek().map(|v| v.parse::<u32>()) {
                    args.next();
                    config = config.with_target_fps(fps);
                }
            }
            "--frames-in-flight" => {
                if let Some(Ok(frames)) = args.peek().map(|v| v.parse::<usize>()) {
                    args.next();
                    config = config.with_frames_in_flight(frames);
                }
            }
            _ => {}
        }
    }
    config
}

fn validation_override(value: Option<&str>) -> Option<bool> {
    match value?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn print_help() {
    eprintln!(
        "Umbra demo viewer with virtual shadow maps

USAGE:
    cargo run -p umbra-viewer -- [OPTIONS]

SHADOW OPTIONS:
    --first-width <W>       World half-width of clipmap level 0 (default: 4.0)
    --lod-bias <B>          Level selection bias, lower is sharper (default: -2.0)

VIEW OPTIONS:
    --debug <MODE>          lit | shadow-factor | clipmap-level | page-residency
    --sun-speed <R>         Sun rotation in radians per second (default: 0.05)

WINDOW OPTIONS:
    --vsync                 Present with FIFO
    --fps <N>               Cap the frame rate
    --frames-in-flight <N>  Number of frame slots (default: 2)

OTHER:
    -h, --help              Print this help message

CONTROLS:
    WASD / arrows           Move, Space / Ctrl up and down, Shift sprint
    Mouse                   Look around while the cursor is locked
    Esc                     Lock or release the cursor
    F3                      Cycle debug view
    [ and ]                 Decrease or increase the LOD bias
    C                       Spawn a cube in front of the camera
    P                       Log the shadow page under the screen centre
    T                       Pause or resume the sun

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)
    UMBRA_VALIDATION        1 or 0 to force Vulkan validation on or off"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn window_flags_reach_the_config() {
        let config = app_config(args(&["--vsync", "--fps", "30", "--frames-in-flight", "3"]));
        assert!(config.vsync);
        assert_eq!(config.target_fps, Some(30));
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!((config.width, config.height), (WIDTH, HEIGHT));
    }

    #[test]
    fn viewer_flags_leave_the_config_alone() {
        let config = app_config(args(&["--lod-bias", "-1", "--fps", "fast"]));
        assert!(!config.vsync);
        assert_eq!(config.target_fps, None);
    }

    #[test]
    fn validation_override_values() {
        assert_eq!(validation_override(None), None);
        assert_eq!(validation_override(Some("1")), Some(true));
        assert_eq!(validation_override(Some(" OFF ")), Some(false));
        assert_eq!(validation_override(Some("maybe")), None);
    }
}
