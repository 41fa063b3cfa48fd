use std::{error::Error, fs, path::Path};

use clap::Parser;
use serde::{Deserialize, Serialize};
use swarm_pgo_core::{Frame, LoopEdge};
use swarm_pgo_pipeline::{OptimizationMode, PgoConfig, PgoReport, PoseGraphEngine};

/// Pose-graph optimization of a recorded multi-robot graph.
#[derive(Debug, Parser)]
#[command(author, version, about = "Centralized pose-graph optimization")]
struct Args {
    /// Path to JSON file containing the frames and loop edges.
    #[arg(long)]
    input: String,

    /// Optional path to JSON PgoConfig. Defaults are used if omitted.
    #[arg(long)]
    config: Option<String>,
}

/// Graph file layout: every frame plus the loop edges between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GraphFile {
    frames: Vec<Frame>,
    #[serde(default)]
    loops: Vec<LoopEdge>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OptimizedGraph {
    frames: Vec<Frame>,
    /// Loops that passed the distance threshold.
    loops: Vec<LoopEdge>,
    report: PgoReport,
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn Error>> {
    let data = fs::read_to_string(path)?;
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

fn optimize_graph(graph: GraphFile, config: PgoConfig) -> Result<OptimizedGraph, Box<dyn Error>> {
    if config.mode == OptimizationMode::Distributed {
        return Err("distributed mode needs a live transport; use centralized".into());
    }
    let engine = PoseGraphEngine::new(config)?;
    for frame in graph.frames {
        engine.add_frame(frame)?;
    }
    for edge in graph.loops {
        engine.add_loop(edge);
    }
    let report = engine.solve()?;

    let frames = engine
        .available_drones()
        .into_iter()
        .flat_map(|drone| engine.frames(drone))
        .collect();
    Ok(OptimizedGraph {
        frames,
        loops: engine.loops(),
        report,
    })
}

fn optimize_from_files(
    input_path: &str,
    config_path: Option<&str>,
) -> Result<String, Box<dyn Error>> {
    let graph: GraphFile = load_json_file(Path::new(input_path))?;
    let config = match config_path {
        Some(path) => load_json_file::<PgoConfig>(Path::new(path))?,
        None => PgoConfig::default(),
    };
    let optimized = optimize_graph(graph, config)?;
    Ok(serde_json::to_string_pretty(&optimized)?)
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let json = optimize_from_files(&args.input, args.config.as_deref())?;
    println!("{json}");
    Ok(())
}
