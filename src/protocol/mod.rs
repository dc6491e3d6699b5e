//! The Tor wire engine: cells, link handshake, per-hop crypto, circuits,
//! and streams.

pub mod cell;
pub mod certs;
pub mod circuit;
pub mod flow;
pub mod hop;
pub mod link;
pub mod ntor;
pub mod relay;

pub use cell::{Cell, CellCommand, LinkFraming};
pub use certs::VerifiedLinkIdentity;
pub use circuit::{Circuit, HopTarget, TorStream};
pub use link::{establish_link, Channel};
pub use relay::{RelayCell, RelayCommand};
