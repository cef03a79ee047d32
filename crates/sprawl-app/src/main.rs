//! Command-line runner: load a scenario (or the built-in demo), step the
//! world, and optionally export an influence-map PNG and step summaries.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use image::GrayImage;
use sprawl_core::{
    AgentKind, AgentSpec, CurveKind, EvaluatorSpec, FunctionSpec, GrowthSettings, InfluenceMap,
    PREVIEW_PROBE_EDGE, Probe, RasterSpec, RoadCategory, SearchSettings, SprawlConfig, SurfaceSpec,
    World,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "sprawl",
    version,
    about = "Grow a settlement by hill-climbing influence fields"
)]
struct Cli {
    /// TOML scenario file; omit to run the built-in demo scene.
    scenario: Option<PathBuf>,

    /// World steps to run.
    #[arg(long, default_value_t = 10)]
    steps: u64,

    /// Override the scenario's RNG seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Write a greyscale PNG of an influence field after the run.
    #[arg(long, value_name = "FILE")]
    map: Option<PathBuf>,

    /// Influence field to render; defaults to the growth field.
    #[arg(long)]
    influence: Option<String>,

    /// Pixel size used when rendering the influence map.
    #[arg(long, default_value_t = 1.0)]
    pixel_size: f64,

    /// Write the run's step summaries as JSON.
    #[arg(long, value_name = "FILE")]
    summary: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.scenario {
        Some(path) => load_scenario(path)?,
        None => demo_config(),
    };
    if let Some(seed) = cli.seed {
        config.rng_seed = Some(seed);
    }

    let mut world = World::new(config).context("building the world")?;
    for _ in 0..cli.steps {
        let summary = world.step();
        info!(
            tick = summary.tick.0,
            placed = summary.placed,
            failed = summary.failed,
            dwellings = summary.dwellings,
            "step"
        );
    }
    info!(
        tick = world.tick().0,
        dwellings = world.dwelling_count(),
        "run finished"
    );

    if let Some(path) = &cli.summary {
        write_summaries(&world, path)?;
    }
    if let Some(path) = &cli.map {
        let name = cli
            .influence
            .clone()
            .unwrap_or_else(|| world.config().growth.influence.clone());
        let probe = Probe::square(PREVIEW_PROBE_EDGE);
        let map = world
            .render_influence_map(&name, &probe, cli.pixel_size)
            .with_context(|| format!("rendering influence field `{name}`"))?;
        write_png(&map, path)?;
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_scenario(path: &Path) -> Result<SprawlConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading scenario {}", path.display()))?;
    let config = toml::from_str(&text)
        .with_context(|| format!("parsing scenario {}", path.display()))?;
    Ok(config)
}

fn write_summaries(world: &World, path: &Path) -> Result<()> {
    let summaries: Vec<_> = world.history().collect();
    let json = serde_json::to_string_pretty(&summaries).context("encoding summaries")?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), steps = summaries.len(), "summaries written");
    Ok(())
}

fn write_png(map: &InfluenceMap, path: &Path) -> Result<()> {
    let (width, height) = (map.width() as u32, map.height() as u32);
    if width == 0 || height == 0 {
        bail!("influence map is empty; try a smaller --pixel-size");
    }
    let image =
        GrayImage::from_raw(width, height, map.to_gray()).context("assembling influence image")?;
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), width, height, "influence map written");
    Ok(())
}

/// A small river-and-crossroads scene that grows out of the box.
fn demo_config() -> SprawlConfig {
    let mut influences = BTreeMap::new();
    influences.insert(
        "house_building".to_owned(),
        vec![
            EvaluatorSpec::Distance {
                label: Some("neighbours".to_owned()),
                target: AgentKind::Dwelling,
                road_categories: None,
                function: FunctionSpec {
                    curve: CurveKind::AttractionRepulsion,
                    l_min: 3.0,
                    l_zero: Some(15.0),
                    l_max: 45.0,
                },
                weight: 0.4,
            },
            EvaluatorSpec::Distance {
                label: Some("roads".to_owned()),
                target: AgentKind::Road,
                road_categories: Some(vec![RoadCategory::Path, RoadCategory::SmallRoad]),
                function: FunctionSpec {
                    curve: CurveKind::OpenDistance,
                    l_min: 2.0,
                    l_zero: None,
                    l_max: 80.0,
                },
                weight: 0.2,
            },
            EvaluatorSpec::Distance {
                label: Some("river".to_owned()),
                target: AgentKind::River,
                road_categories: None,
                function: FunctionSpec {
                    curve: CurveKind::CloseDistance,
                    l_min: 15.0,
                    l_zero: None,
                    l_max: 400.0,
                },
                weight: 0.2,
            },
            EvaluatorSpec::Slope {
                label: Some("terrain".to_owned()),
                raster: "topography".to_owned(),
                function: FunctionSpec {
                    curve: CurveKind::OpenDistance,
                    l_min: 0.3,
                    l_zero: None,
                    l_max: 0.6,
                },
                weight: 0.2,
            },
        ],
    );
    SprawlConfig {
        border: vec![[0.0, 0.0], [300.0, 0.0], [300.0, 300.0], [0.0, 300.0]],
        growth: GrowthSettings {
            dwellings_per_step: 3,
            influence: "house_building".to_owned(),
            area_min: 40.0,
            area_max: 90.0,
        },
        search: SearchSettings { restarts: 3 },
        rasters: vec![RasterSpec {
            name: "topography".to_owned(),
            west: -20.0,
            north: 320.0,
            pixel_size: 2.0,
            width: 170,
            height: 170,
            no_data: None,
            surface: SurfaceSpec::Plane {
                base: 140.0,
                x_gradient: 0.02,
                y_gradient: 0.01,
            },
        }],
        agents: vec![
            AgentSpec {
                kind: AgentKind::River,
                category: None,
                ring: Some(vec![[0.0, 0.0], [30.0, 0.0], [30.0, 300.0], [0.0, 300.0]]),
                path: None,
            },
            AgentSpec {
                kind: AgentKind::Road,
                category: Some(RoadCategory::Path),
                ring: None,
                path: Some(vec![[35.0, 150.0], [300.0, 150.0]]),
            },
            AgentSpec {
                kind: AgentKind::Road,
                category: Some(RoadCategory::SmallRoad),
                ring: None,
                path: Some(vec![[200.0, 0.0], [200.0, 300.0]]),
            },
            AgentSpec {
                kind: AgentKind::Dwelling,
                category: None,
                ring: Some(vec![
                    [146.0, 136.0],
                    [154.0, 136.0],
                    [154.0, 144.0],
                    [146.0, 144.0],
                ]),
                path: None,
            },
            AgentSpec {
                kind: AgentKind::Dwelling,
                category: None,
                ring: Some(vec![
                    [160.0, 150.0],
                    [168.0, 150.0],
                    [168.0, 158.0],
                    [160.0, 158.0],
                ]),
                path: None,
            },
        ],
        influences,
        ..SprawlConfig::default()
    }
}
