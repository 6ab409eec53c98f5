// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use meshlink::client::{RpcDialer, RpcOptions};
use meshlink::registry::{new_target, Registrar};
use meshlink::tarpc::context;
use meshlink::transport::Codec;
use meshlink::{ConnectionPool, MemoryRegistry, PoolConfig, ResolvedState, ResolverBuilder};
use service::{init_tracing, EchoClient, EchoNode, EchoRequest, EchoResponse};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const SERVICE: &str = "echo";
const REGISTRATION_TTL: Duration = Duration::from_secs(10);

#[derive(Parser)]
struct Flags {
    /// Number of echo nodes to start; the first two are version 1.0, the rest 1.1.
    #[clap(long, default_value_t = 3)]
    nodes: usize,
    /// Only resolve nodes of this version.
    #[clap(long)]
    version: Option<String>,
    /// Transport codec.
    #[clap(long, default_value_t = Codec::Bincode)]
    codec: Codec,
    /// Number of calls to make.
    #[clap(long, default_value_t = 6)]
    calls: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing()?;

    let registry = Arc::new(MemoryRegistry::new());
    let registrar = Registrar::new(registry.clone());
    let mut nodes = Vec::with_capacity(flags.nodes);
    for i in 0..flags.nodes {
        let version = if i < 2 { "1.0" } else { "1.1" };
        let node = EchoNode { node: format!("node-{i}") };
        let addr = service::serve(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), flags.codec, node).await?;
        registrar.register(SERVICE, version, &addr.to_string(), REGISTRATION_TTL).await?;
        nodes.push((version, addr.to_string()));
    }
    let _heartbeat = registrar.spawn_heartbeat(REGISTRATION_TTL / 3, REGISTRATION_TTL);

    let builder = ResolverBuilder::new(registry.clone());
    let (tx, mut rx) = watch::channel(ResolvedState::default());
    let target = new_target(SERVICE, flags.version.as_deref());
    let resolver = builder.build(&target, tx).await?;
    tracing::info!("resolved {} to {:?}", target, addresses(&rx.borrow_and_update()));

    let pool = ConnectionPool::new(RpcDialer::<EchoRequest, EchoResponse>::new(), PoolConfig::from_env()?);
    let options = RpcOptions::default().with_codec(flags.codec);
    for i in 0..flags.calls {
        let Some(addr) = pick(&rx.borrow(), i) else {
            tracing::warn!("no address for {}", target);
            break;
        };
        let mut conn = pool.get(&addr, &options).await?;
        match EchoClient::from((*conn).clone()).echo(context::current(), format!("call {i}")).await {
            Ok(reply) => tracing::info!("{addr} replied {reply:?}"),
            Err(e) => {
                tracing::warn!("{addr} failed: {e}");
                conn.set_error(e);
            },
        }
    }

    if let Some((version, addr)) = nodes.first() {
        registrar.deregister(SERVICE, version, addr).await?;
        if tokio::time::timeout(Duration::from_secs(3), rx.changed()).await.is_ok() {
            tracing::info!("after deregistering {} resolved to {:?}", addr, addresses(&rx.borrow_and_update()));
        }
    }

    resolver.close();
    registrar.deregister_all().await;
    pool.clear();
    Ok(())
}

fn addresses(state: &ResolvedState) -> Vec<&str> {
    state.addresses.iter().map(|a| a.addr()).collect()
}

fn pick(state: &ResolvedState, i: usize) -> Option<String> {
    if state.addresses.is_empty() {
        return None;
    }
    Some(state.addresses[i % state.addresses.len()].addr().to_string())
}
