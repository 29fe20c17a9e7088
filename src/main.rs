//! Headless demo: renders a small graph and writes the result as a PNG.
//!
//! ```text
//! hotgraph [--gpu] [out.png]
//! ```

use std::process::ExitCode;

use hotgraph::{DeviceKind, Engine, EngineConfig, EngineEvent, PortValue, Result, Rgba, nodes};
use log::{error, info};

fn run(device: DeviceKind, out: &str) -> Result<()> {
    let config = EngineConfig::from_env().device(device).watch_sources(false);
    let mut engine = Engine::new(config)?;
    nodes::register_builtins(&mut engine);

    let color = engine.add_node("solid_color")?;
    let invert = engine.add_node("invert")?;
    let output = engine.add_node("output")?;

    engine.connect(engine.output(color, "image")?, engine.input(invert, "image")?)?;
    engine.connect(engine.output(invert, "image")?, engine.input(output, "image")?)?;
    engine.set_input(
        engine.input(color, "color")?,
        PortValue::Color(Rgba::new(255.0, 64.0, 0.0, 1.0)),
    )?;
    engine.set_input(engine.input(color, "width")?, PortValue::Number(320.0))?;
    engine.set_input(engine.input(color, "height")?, PortValue::Number(180.0))?;

    let frame = engine.tick();
    info!("rendered frame {} in order {:?}", frame.index, frame.order);
    for event in engine.drain_events() {
        if let EngineEvent::NodeFailed { node, error, .. } = &event {
            error!("node {node} failed: {error}");
        }
    }

    match engine.read_image(engine.input(output, "image")?)? {
        Some(image) => {
            image
                .save(out)
                .map_err(|e| hotgraph::NodeError::runtime(format!("writing {out}: {e}")))
                .map_err(|error| hotgraph::EngineError::Node { node: output, error })?;
            info!("wrote {}x{} image to {out}", image.width(), image.height());
        }
        None => error!("output node received no image"),
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut device = DeviceKind::Cpu;
    let mut out = String::from("hotgraph.png");
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--gpu" => device = DeviceKind::Wgpu,
            _ => out = arg,
        }
    }

    match run(device, &out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
