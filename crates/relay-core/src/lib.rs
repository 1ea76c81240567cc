//! Telemetry relay pipeline.
//!
//! Each stream kind runs its own chain:
//! producers → [`SampleQueue`] → [`StreamServer`] → [`IngestionReader`] →
//! [`BackpressureQueue`] → [`BatchAccumulator`] → [`BulkPersister`] → storage,
//! with every consumed record also relayed to [`LiveBroadcaster`] viewers.
//! Chains share no mutable state.

pub mod accumulator;
pub mod backpressure;
pub mod broadcast;
pub mod exit_codes;
pub mod http;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod normalize;
pub mod persist;
pub mod pipeline;
pub mod producer;
pub mod sample_queue;
pub mod stream_server;
pub mod upstream;
pub mod viewer;

pub use accumulator::{BatchAccumulator, FlushReport};
pub use backpressure::BackpressureQueue;
pub use broadcast::{BroadcastReport, LiveBroadcaster};
pub use exit_codes::ExitCode;
pub use http::{HttpError, HttpServer, IngestEndpoint};
pub use ingest::{IngestionReader, ReaderExit};
pub use metrics::RelayMetrics;
pub use normalize::{NormalizeError, Normalizer};
pub use persist::{BulkPersister, PersistError, PersistFailure};
pub use pipeline::{Pipeline, PipelineHandle, ShutdownReport};
pub use producer::Producers;
pub use sample_queue::SampleQueue;
pub use stream_server::{StreamServer, StreamSource};
pub use upstream::{connect_upstream, TransportError, UpstreamConnection};
pub use viewer::ViewerServer;
