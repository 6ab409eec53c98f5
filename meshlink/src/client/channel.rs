// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! RPC channels over tcp, dialed through a [`ConnectionPool`](super::pool::ConnectionPool).

use super::pool::{Dialer, PoolError};
use crate::transport::codec::*;
use ::tarpc::client::{Channel, Config as CoreConfig};
use ::tarpc::tokio_util::codec::length_delimited::LengthDelimitedCodec;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;
use tokio::net::TcpStream;

/// Settings used to dial an RPC channel.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RpcOptions {
    /// transport codec type.
    pub codec: Codec,
    /// Bound on the tcp connect.
    pub connect_timeout: Duration,
    /// Maximum frame length, default is usize::MAX.
    pub max_frame_length: usize,
    /// Disables Nagle's algorithm when true.
    pub nodelay: bool,
    /// Idle time before tcp keepalive probes start; `None` leaves the system default.
    pub keepalive: Option<Duration>,
    /// Settings that control the behavior of the underlying client.
    pub core_config: CoreConfig,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            connect_timeout: Duration::from_secs(3),
            max_frame_length: usize::MAX,
            nodelay: true,
            keepalive: None,
            core_config: CoreConfig::default(),
        }
    }
}

impl RpcOptions {
    /// Set transport serde codec
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }
    /// Set the tcp connect timeout.
    /// Default is 3s.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
    /// Set maximum frame length, default is usize::MAX.
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        if max_frame_length == 0 {
            self.max_frame_length = usize::MAX;
        } else {
            self.max_frame_length = max_frame_length;
        }
        self
    }
    /// Set TCP_NODELAY.
    /// Default is true.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
    /// Enable tcp keepalive after `idle`.
    pub fn with_keepalive(mut self, idle: Duration) -> Self {
        self.keepalive = Some(idle);
        self
    }
    /// The number of requests that can be in flight at once.
    /// `max_in_flight_requests` controls the size of the map used by the client
    /// for storing pending requests.
    /// Default is 1000.
    pub fn with_max_in_flight_requests(mut self, max_in_flight_requests: usize) -> Self {
        self.core_config.max_in_flight_requests = max_in_flight_requests;
        self
    }
    /// The number of requests that can be buffered client-side before being sent.
    /// `pending_requests_buffer` controls the size of the channel clients use
    /// to communicate with the request dispatch task.
    /// Default is 100.
    pub fn with_pending_request_buffer(mut self, pending_request_buffer: usize) -> Self {
        self.core_config.pending_request_buffer = pending_request_buffer;
        self
    }
}

/// [`RpcDialer`] opens tarpc [`Channel`]s to `host:port` addresses.
pub struct RpcDialer<Req, Resp> {
    _marker: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> RpcDialer<Req, Resp> {
    /// Creates a dialer.
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<Req, Resp> Default for RpcDialer<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> Clone for RpcDialer<Req, Resp> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<Req, Resp> Dialer for RpcDialer<Req, Resp>
where
    Req: Serialize + Send + 'static,
    Resp: for<'de> Deserialize<'de> + Send + 'static,
{
    type Conn = Channel<Req, Resp>;
    type Options = RpcOptions;

    async fn dial(&self, address: &str, options: &RpcOptions) -> Result<Self::Conn, PoolError> {
        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(PoolError::dial(address, e)),
            Err(_) => return Err(PoolError::dial(address, format!("connect timed out after {:?}", options.connect_timeout))),
        };
        configure(&stream, options).map_err(|e| PoolError::dial(address, e))?;
        let framed = LengthDelimitedCodec::builder().max_frame_length(options.max_frame_length).new_framed(stream);
        let core_config = options.core_config.clone();
        let channel = match options.codec {
            Codec::Bincode => {
                // Bincode codec using [bincode](https://docs.rs/bincode) crate.
                ::tarpc::client::new(core_config, crate::transport::new(framed, Bincode::default())).spawn()
            },
            Codec::Json => {
                // JSON codec using [serde_json](https://docs.rs/serde_json) crate.
                ::tarpc::client::new(core_config, crate::transport::new(framed, Json::default())).spawn()
            },
            #[cfg(feature = "serde-transport-messagepack")]
            Codec::MessagePack => ::tarpc::client::new(core_config, crate::transport::new(framed, MessagePack::default())).spawn(),
            #[cfg(feature = "serde-transport-cbor")]
            Codec::Cbor => ::tarpc::client::new(core_config, crate::transport::new(framed, Cbor::default())).spawn(),
        };
        Ok(channel)
    }
}

fn configure(stream: &TcpStream, options: &RpcOptions) -> std::io::Result<()> {
    stream.set_nodelay(options.nodelay)?;
    if let Some(idle) = options.keepalive {
        socket2::SockRef::from(stream).set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(idle))?;
    }
    Ok(())
}
