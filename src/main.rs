use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use uamirror::client::ClientSource;
use uamirror::config::Config;
use uamirror::graph::GraphStore;
use uamirror::opt::Opt;
use uamirror::sim::SimServer;
use uamirror::ua::{Connector, NodeId, Variant};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::parse();
    if !opt.simulate {
        // Wiring a real codec behind the transport traits is the
        // embedder's job; the binary only ships the simulation.
        return Err(anyhow!(
            "only --simulate is supported by this binary; \
             use the library with your own transport for real servers"
        ));
    }
    let config = Config::load(&opt)?;

    let server = SimServer::new();
    let root_node = config.client.root_node.clone();
    populate_plant(&server, &root_node);
    let mutator = spawn_mutator(server.clone());

    let graph = GraphStore::new();
    let root = graph.create_subject("Plant");
    let source = ClientSource::start(
        Arc::new(server.connector()) as Arc<dyn Connector>,
        graph,
        root,
        config.client,
    )?;

    info!("mirroring; press Enter to stop");
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    info!(metrics = ?source.metrics(), "shutting down");
    source.dispose();
    drop(mutator);
    Ok(())
}

/// A small simulated plant to mirror.
fn populate_plant(server: &SimServer, root_node: &NodeId) {
    server.add_object(None, root_node.clone(), "Objects");
    for i in 0..3 {
        let motor = NodeId::string(2, format!("Plant/Motors[{}]", i));
        server.add_object(
            Some(root_node),
            motor.clone(),
            format!("Motors[{}]", i),
        );
        server.add_variable(
            Some(&motor),
            NodeId::string(2, format!("Plant/Motors[{}]/Speed", i)),
            "Speed",
            Variant::Double(0.0),
        );
        server.add_variable(
            Some(&motor),
            NodeId::string(2, format!("Plant/Motors[{}]/Temperature", i)),
            "Temperature",
            Variant::Double(20.0),
        );
    }
}

/// Drives simulated value changes so there is something to watch.
fn spawn_mutator(server: SimServer) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut tick = 0u64;
        loop {
            thread::sleep(Duration::from_millis(500));
            tick += 1;
            for i in 0..3 {
                let speed =
                    NodeId::string(2, format!("Plant/Motors[{}]/Speed", i));
                let value = ((tick + i) % 100) as f64;
                server.set_value(&speed, Variant::Double(value));
            }
        }
    })
}
