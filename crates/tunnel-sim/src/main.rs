//! Run the tunnel data plane across a few routers in one process.
//!
//! The simulator starts a small network, builds an outbound and an
//! inbound tunnel for the first router, and pushes traffic through
//! every role: gateways, participants, both kinds of endpoint, and the
//! zero-hop shortcuts.  Then it reports what each router counted.

#![warn(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

mod cmdline;
mod net;

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use argh::FromArgs;
use bytes::Bytes;
use rand::{Rng, RngCore};
use serde::Deserialize;
use tracing::{info, warn, Level};

use tunnel_cell::i2np::{I2npMessage, MessageType, TunnelGateway};
use tunnel_dispatch::config::DispatchConfig;

use cmdline::Overrides;
use net::{SimNet, Tunnel};

#[derive(FromArgs, Debug, Clone)]
/// Push traffic through tunnels across a handful of in-memory routers,
/// and report what every router saw.
struct Args {
    /// read configuration from this file (may be repeated)
    #[argh(option, short = 'f')]
    rc: Vec<String>,
    /// override a configuration option (uses toml syntax)
    #[argh(option, short = 'c')]
    cfg: Vec<String>,
}

/// Default options to use for our configuration.
const SIM_DEFAULTS: &str = include_str!("./sim_defaults.toml");

/// Everything the simulator can be told.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct SimConfig {
    /// Whether to log at trace level.
    trace: bool,
    /// The shape of the simulation.
    sim: SimSettings,
    /// Settings for every router's dispatcher.
    #[serde(default)]
    dispatch: DispatchConfig,
}

/// The shape of one simulation.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct SimSettings {
    /// Routers in the network, including ours.
    routers: usize,
    /// Hops in each of our tunnels, including ours.
    hops: usize,
    /// Messages sent down our outbound tunnel.
    outbound_messages: usize,
    /// Messages sent through our inbound tunnel.
    inbound_messages: usize,
    /// Body size of each message.
    message_size: usize,
    /// Forbidden messages sent down our inbound tunnel.
    forbidden_messages: usize,
    /// How long to wait for everything to arrive.
    #[serde(with = "humantime_serde")]
    run_time: Duration,
    /// Lifetime of every tunnel.
    #[serde(with = "humantime_serde")]
    tunnel_lifetime: Duration,
}

impl SimSettings {
    /// Refuse shapes we can't build.
    fn validate(&self) -> Result<()> {
        if self.routers < 2 || self.routers > 200 {
            bail!("need between 2 and 200 routers, not {}", self.routers);
        }
        if self.hops == 0 || self.hops > self.routers {
            bail!("can't build {}-hop tunnels from {} routers", self.hops, self.routers);
        }
        if self.message_size == 0 || self.message_size > 32 * 1024 {
            bail!("message size {} out of range", self.message_size);
        }
        Ok(())
    }
}

/// Load configuration: built-in defaults, then `files` in order, then
/// `opts`.
fn load_config<P: AsRef<Path>, S: AsRef<str>>(files: &[P], opts: &[S]) -> Result<SimConfig> {
    let mut cfg = config::Config::new();
    cfg.merge(config::File::from_str(SIM_DEFAULTS, config::FileFormat::Toml))?;
    for f in files {
        let f: config::File<_> = f.as_ref().into();
        cfg.merge(f.format(config::FileFormat::Toml).required(true))?;
    }
    cfg.merge(Overrides::new(opts))?;
    Ok(cfg.try_into()?)
}

/// What happened in one simulation.
#[derive(Debug, Default)]
struct Report {
    /// Messages that left our outbound tunnel and reached the target.
    outbound_delivered: u64,
    /// Of those, how many came out of the target's own tunnel.
    via_target_tunnel: u64,
    /// Messages that came out of our inbound tunnel.
    inbound_delivered: u64,
    /// Forbidden messages our inbound endpoint refused.
    forbidden_refused: u64,
    /// Messages the wire carried between routers.
    carried: u64,
    /// True if everything arrived in time.
    complete: bool,
}

/// Make a message of type `ty` with a random body.
fn message(ty: MessageType, size: usize, expiration: u64) -> I2npMessage {
    let mut rng = rand::thread_rng();
    let mut body = vec![0_u8; size];
    rng.fill_bytes(&mut body);
    I2npMessage::new(ty, rng.gen::<u32>().into(), expiration, Bytes::from(body))
}

/// Log every nonzero counter of every router.
fn log_counters(net: &SimNet) {
    for (i, r) in net.routers().iter().enumerate() {
        let t = &r.table;
        let counters = t
            .stats()
            .snapshot()
            .into_iter()
            .chain(t.gateway_stats().snapshot())
            .chain(t.batch_stats().snapshot())
            .chain(t.reassembly_stats().snapshot())
            .chain(t.pool_stats().snapshot())
            .filter(|(_, v)| *v > 0)
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        info!(
            "router {} ({} tunnels, {} B/s allocated): received {} ({} bytes); {}",
            i,
            t.n_registered(),
            t.allocated_bandwidth(),
            r.inbox.messages(),
            r.inbox.bytes(),
            counters.join(" ")
        );
    }
}

/// Run one simulation.
fn run(config: &SimConfig) -> Result<Report> {
    let s = &config.sim;
    s.validate()?;
    let net = SimNet::new(s.routers, &config.dispatch)?;
    let target = s.routers - 1;

    // Router 0 is ours.  Its outbound tunnel runs through routers
    // 1..hops; its inbound tunnel comes back the same way.
    let out_path: Vec<usize> = (0..s.hops).collect();
    let in_path: Vec<usize> = out_path.iter().rev().copied().collect();
    let outbound = net.build_outbound(&out_path, s.tunnel_lifetime)?;
    let inbound = net.build_inbound(&in_path, s.tunnel_lifetime, None)?;
    // The target has a zero-hop inbound tunnel of its own.
    let target_tunnel: Tunnel = net.build_inbound(&[target], s.tunnel_lifetime, None)?;

    let expiration = net.now_ms() + 60_000;
    for i in 0..s.outbound_messages {
        // Only some types may leave an inbound tunnel; plain data isn't
        // one of them.
        let (ty, tunnel) = if i % 2 == 1 {
            (MessageType::GARLIC, Some(target_tunnel.gateway_id))
        } else {
            (MessageType::DATA, None)
        };
        let msg = message(ty, s.message_size, expiration);
        let target_id = net.router(target).id;
        if !net
            .router(0)
            .table
            .dispatch_outbound(msg, outbound.local_id, tunnel, target_id)?
        {
            warn!("Outbound message {} was dropped at the gateway", i);
        }
    }

    let gateway = in_path[0];
    let inject = |ty: MessageType, size: usize| -> Result<()> {
        let wrapped = TunnelGateway::new(inbound.gateway_id, message(ty, size, expiration))
            .into_message(rand::thread_rng().gen::<u32>().into(), expiration)?;
        net.send(target, gateway, wrapped);
        Ok(())
    };
    for _ in 0..s.inbound_messages {
        inject(MessageType::GARLIC, s.message_size)?;
    }
    for _ in 0..s.forbidden_messages {
        inject(MessageType::DATABASE_LOOKUP, 64)?;
    }

    let want_out = s.outbound_messages as u64;
    let want_in = s.inbound_messages as u64;
    let want_refused = s.forbidden_messages as u64;
    let complete = net.wait_for(s.run_time, |n| {
        n.router(target).inbox.messages() >= want_out
            && n.router(0).inbox.messages() >= want_in
            && n.router(0).table.stats().dangerous_dropped.get() >= want_refused
    });

    log_counters(&net);
    let report = Report {
        outbound_delivered: net.router(target).inbox.messages(),
        via_target_tunnel: net.router(target).inbox.via_tunnel(),
        inbound_delivered: net.router(0).inbox.messages(),
        forbidden_refused: net.router(0).table.stats().dangerous_dropped.get(),
        carried: net.wire().carried(),
        complete,
    };
    info!("{:?}", report);
    Ok(report)
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let config = load_config(&args.rc, &args.cfg)?;

    let level = if config.trace {
        Level::TRACE
    } else {
        Level::DEBUG
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let report = run(&config)?;
    if !report.complete {
        bail!(
            "only {} of {} outbound and {} of {} inbound messages arrived",
            report.outbound_delivered,
            config.sim.outbound_messages,
            report.inbound_delivered,
            config.sim.inbound_messages
        );
    }
    Ok(())
}
