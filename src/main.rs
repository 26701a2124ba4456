//! Demonstration binary: spin up a host zone and an in-process child zone,
//! expose a calculator implementation from the child, and drive round-trip
//! calls through the full proxy/stub path. Useful as smoke coverage and as
//! a worked example of wiring zones together.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*};

use interzone::{connect_root, link_zones, ChildService, Service, ZoneId};

mod calculator;
mod cli;
mod logging;

use calculator::{CalculatorGlue, CalculatorImpl};
use cli::Args;
use logging::ZoneLogFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        LevelFilter::ERROR
    } else {
        match args.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(ZoneLogFormatter)
                .with_filter(log_level),
        )
        .init();

    calculator::register();

    let host = Service::new("host", ZoneId::new(1));
    let child_service = Service::new("child", ZoneId::new(2));
    let child = ChildService::new(child_service.clone(), host.zone_id().as_destination());

    let link = link_zones(&host, &child_service);
    link.proxy_a_to_b.set_encoding(args.encoding.into());
    link.proxy_b_to_a.set_encoding(args.encoding.into());
    debug!(
        host = %host.zone_id(),
        child = %child_service.zone_id(),
        "zones linked"
    );

    let remote = connect_root::<CalculatorGlue>(&host, &child, Arc::new(CalculatorImpl)).await?;
    info!(
        root_object = %child.root_object_id().expect("root bound").get(),
        "child zone exposed its calculator"
    );

    for call in 1..=args.calls {
        let sum = remote.add(args.lhs, args.rhs).await?;
        info!(call, "{} + {} = {}", args.lhs, args.rhs, sum);
    }

    // dropping the proxy hands its remote reference to a cleanup task;
    // let it drain before tearing the zones down
    drop(remote);
    tokio::time::sleep(Duration::from_millis(50)).await;

    child.shutdown().await;
    link.shutdown().await;
    host.shutdown().await;
    debug!("zones torn down");
    Ok(())
}
