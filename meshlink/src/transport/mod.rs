// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Serde transports over `AsyncRead + AsyncWrite` streams.

pub mod codec;
pub use ::tarpc::serde_transport::new;
pub use ::tarpc::Transport;
pub use codec::Codec;

pub mod tcp {
    //! tcp transport
    pub use ::tarpc::serde_transport::tcp::*;
}
