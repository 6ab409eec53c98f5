// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use futures::prelude::*;
use meshlink::tarpc::context;
use meshlink::tarpc::server::{BaseChannel, Channel};
use meshlink::transport::codec::{Bincode, Codec, Json};
use meshlink::transport::tcp;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// This is the service definition. It looks a lot like a trait definition.
/// It defines one RPC, echo, which takes one arg, msg, and returns it prefixed by the node name.
#[tarpc::service]
pub trait Echo {
    async fn echo(msg: String) -> String;
}

/// Serves [`Echo`] on behalf of one registered node.
#[derive(Clone)]
pub struct EchoNode {
    pub node: String,
}

impl Echo for EchoNode {
    async fn echo(self, _: context::Context, msg: String) -> String {
        format!("{}: {msg}", self.node)
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

/// Listens on `addr` and serves `node` in the background, returning the bound address.
pub async fn serve(addr: SocketAddr, codec: Codec, node: EchoNode) -> anyhow::Result<SocketAddr> {
    macro_rules! listen {
        ($format:expr) => {{
            let mut listener = tcp::listen(addr, $format).await?;
            listener.config_mut().max_frame_length(usize::MAX);
            let local_addr = listener.local_addr();
            tokio::spawn(
                listener
                    // Ignore accept errors.
                    .filter_map(|r| future::ready(r.ok()))
                    .map(BaseChannel::with_defaults)
                    .map(move |channel| channel.execute(node.clone().serve()).for_each(spawn))
                    // Max 10 channels.
                    .buffer_unordered(10)
                    .for_each(|_| async {}),
            );
            local_addr
        }};
    }
    Ok(match codec {
        Codec::Json => listen!(Json::default),
        _ => listen!(Bincode::default),
    })
}

/// Initializes a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::registry().with(filter).with(fmt::layer()).try_init()?;
    Ok(())
}
