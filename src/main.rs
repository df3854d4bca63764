//! calcgraph - run a graph file from the command line
//!
//! ```text
//! calcgraph <graph.toml|graph.json> [--log-dir DIR] [--side-packet NAME=JSON]...
//! ```
//!
//! Every stream listed in the graph's `output_stream` is observed and its
//! packets are logged. Graph input streams are closed right away, so graphs
//! fed from outside only see their sources.

use anyhow::{bail, Context};
use calcgraph::{calculators::constant_packet, CalculatorGraph, GraphConfig, Packet};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct Args {
    graph: PathBuf,
    log_dir: Option<PathBuf>,
    side_packets: HashMap<String, Packet>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut graph = None;
    let mut log_dir = None;
    let mut side_packets = HashMap::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--log-dir" => {
                log_dir = Some(PathBuf::from(args.next().context("--log-dir needs a value")?));
            }
            "--side-packet" => {
                let value = args.next().context("--side-packet needs NAME=JSON")?;
                let (name, json) = value
                    .split_once('=')
                    .context("--side-packet needs NAME=JSON")?;
                let json: serde_json::Value = serde_json::from_str(json)
                    .with_context(|| format!("side packet '{}' is not valid JSON", name))?;
                side_packets.insert(name.to_string(), constant_packet(&json));
            }
            other if other.starts_with("--") => bail!("unknown option {}", other),
            other if graph.is_none() => graph = Some(PathBuf::from(other)),
            other => bail!("unexpected argument {}", other),
        }
    }

    Ok(Args {
        graph: graph.context("usage: calcgraph <graph> [--log-dir DIR] [--side-packet NAME=JSON]")?,
        log_dir,
        side_packets,
    })
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let (file_layer, _guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "calcgraph.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,calcgraph=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    let config = GraphConfig::load(&args.graph)
        .with_context(|| format!("loading {}", args.graph.display()))?;
    let outputs = config.output_stream.clone();
    let has_inputs = !config.input_stream.is_empty();

    let mut graph = CalculatorGraph::new();
    graph.initialize(config, HashMap::new())?;
    for stream in &outputs {
        let name = stream.clone();
        graph.observe_output_stream(
            stream,
            move |packet| {
                tracing::info!(stream = %name, timestamp = %packet.timestamp(), packet = ?packet, "output");
                Ok(())
            },
            false,
        )?;
    }

    tracing::info!(graph = %args.graph.display(), "starting run");
    if has_inputs {
        graph.start_run(args.side_packets)?;
        graph.close_all_input_streams()?;
        graph.wait_until_done()?;
    } else {
        graph.run(args.side_packets)?;
    }
    tracing::info!("run finished");
    Ok(())
}
