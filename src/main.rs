// Host-side demo driver: runs the full motion pipeline against the
// simulated backend so a cut program can be exercised without hardware.

use clap::Parser;
use hotwire_core::config::{self, Settings};
use hotwire_core::hal::SimBackend;
use hotwire_core::machine::Machine;

#[derive(Parser)]
#[command(name = "cutter-host", about = "Hot-wire cutter motion core, simulated host")]
struct Args {
    /// Settings file (TOML). Stock profile is used when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Home the machine before cutting.
    #[arg(long)]
    home: bool,

    /// Side length of the demo square cut, in mm.
    #[arg(long, default_value_t = 10.0)]
    side: f64,

    /// Feed rate for the demo cut, in mm/min. Falls back to the
    /// profile's default feed rate.
    #[arg(long)]
    feed: Option<f64>,
}

/// Cut and rapid rates for the demo program: CLI override first, then
/// the settings profile.
fn demo_rates(args: &Args, settings: &Settings) -> (f64, f64) {
    let feed = args.feed.unwrap_or(settings.feed.default_feed_rate);
    (feed, settings.feed.default_seek_rate)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let settings = match &args.config {
        Some(path) => {
            tracing::info!("Loading settings from: {}", path);
            config::load_settings(path)?
        }
        None => {
            tracing::info!("No settings file given, using the stock profile");
            Settings::default()
        }
    };
    tracing::info!(
        "Steps/mm: {:?}, accel: {} mm/s^2, junction deviation: {} mm",
        settings.axes.steps_per_mm,
        settings.stepper.acceleration / 3600.0,
        settings.stepper.junction_deviation
    );

    let (f, seek) = demo_rates(&args, &settings);

    // Simulated machine with limit switches a little under the origin on
    // every axis, the way the real gantries sit after a manual jog.
    let mut sim = SimBackend::new();
    for axis in 0..hotwire_core::N_AXIS {
        sim = sim.with_switch(axis, -400);
    }
    let mut machine = Machine::new(settings, sim);
    let pump = machine.spawn_pump();

    if args.home {
        tracing::info!("Homing all axes");
        machine.home().await?;
        let status = machine.status();
        tracing::info!("Homed, machine zero at {:?} mm", status.position_mm);
    }

    // Demo program: a square cut with rounded exit, both gantries moving
    // in parallel so the wire stays square to the travel.
    let s = args.side;
    tracing::info!("Cutting a {} mm square at {} mm/min", s, f);
    let motion = machine.motion();
    // Rapid approach to the first corner, then cut.
    motion.line([s, 0.0, 0.0, s], seek, false).await?;
    motion.line([s, s, s, s], f, false).await?;
    motion.line([0.0, s, s, 0.0], f, false).await?;
    motion.line([0.0, 0.0, 0.0, 0.0], f, false).await?;
    // Quarter-circle lead-out on the XY gantry.
    motion
        .arc([s / 4.0, s / 4.0, 0.0, 0.0], [s / 4.0, 0.0], (0, 1), true, f, false)
        .await?;
    motion.dwell(0.5).await?;
    motion.synchronize().await?;

    machine.service().await;
    let status = machine.status();
    tracing::info!(
        "Cut complete, position {:?} mm, state {:?}",
        status.position_mm,
        status.state
    );

    pump.abort();
    Ok(())
}
