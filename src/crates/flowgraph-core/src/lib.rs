//! # flowgraph-core
//!
//! The engine of the FlowGraph runtime: a single-threaded [`reactor`] with
//! an embedded timer heap and task queue, non-blocking framed [`stream`]s
//! over owned [`device`]s, the declarative [`graph`] model, and the
//! [`executor`] that materializes a graph (or one container of it) onto a
//! reactor.
//!
//! A minimal local run:
//!
//! ```no_run
//! use flowgraph_core::executor::Executor;
//! use flowgraph_core::graph::Graph;
//! use flowgraph_core::reactor::Signal;
//!
//! let g = Graph::new();
//! let a = g.vertex();
//! let b = g.vertex();
//! let ab = g.stream(&a, &b);
//! let ab_key = ab.key();
//!
//! ab.on_istream(|_b, is| {
//!     if let Ok(Some(text)) = is.recv::<String>() {
//!         println!("received: {text}");
//!         return Signal::Remove;
//!     }
//!     Signal::Default
//! });
//! a.on_enter(move |v| {
//!     v.send(ab_key, &"hello".to_string()).unwrap();
//! });
//!
//! let code = Executor::new(g).unwrap().run().unwrap();
//! assert_eq!(code, 0);
//! ```

pub mod device;
pub mod error;
pub mod executor;
pub mod graph;
pub mod promise;
pub mod reactor;
pub mod stream;

pub use device::{BlockFile, Device, Notifier, Socket};
pub use flowgraph_protocol::ExecutionMode;
pub use error::{CoreError, Result};
pub use executor::Executor;
pub use graph::{Graph, PlaceHolder, Vertex};
pub use promise::{spawn_async, Promise};
pub use reactor::{EventId, Reactor, Signal};
pub use stream::{InputStream, OutputStream, StreamEvent};
