//! The connection acceptance and framing core of the game server.
//!
//! The core turns raw inbound TCP bytes into ordered, length-prefixed,
//! protocol-tagged messages handed to a pluggable protocol handler, and
//! streams outbound messages back. The main components:
//!
//! - `net::reactor::Reactor`, a shared event engine: one poll thread owning a
//!   `mio::Poll`, a worker pool running completions, and a timer queue.
//! - `net::acceptor::ServicePort`, one per listening port: accepts sockets,
//!   consults the admission service and assigns a protocol factory. Bind
//!   failures self-heal through a retry timer.
//! - `net::connection::Connection`, the per-socket state machine: proxy
//!   preamble detection, header/body frame reads with checksum validation and
//!   a per-source rate limit, and a strictly ordered write queue.
//! - `net::service::ServiceManager`, the lifecycle root: starts the reactor,
//!   stops acceptors, drains and joins.
//! - `dispatcher::Dispatcher`, the single game thread onto which the two
//!   lifecycle hooks (`on_connect`, `release`) are deferred.
//!
//! A connection observes the following workflow:
//!
//! 1. The acceptor registers the fresh socket with the reactor and either
//!    constructs the sole single-socket protocol immediately or waits for the
//!    first frame to pick a factory by protocol identifier.
//! 2. Frames are read strictly in sequence, header then body. The first frame
//!    of a checksummed service carries an Adler-32 over the rest of the body;
//!    a mismatch is not an error but a checksum-less dialect, and the read
//!    cursor steps back over the four bytes.
//! 3. Outbound messages are queued FIFO with only the head in flight, so
//!    peers observe sends in submission order.
//! 4. Closing is idempotent: the connection deregisters itself once, the
//!    handler's `release` is deferred onto the dispatcher, and queued writes
//!    drain unless the close was forced.

pub mod config;
pub mod dispatcher;
pub mod net;
