// Declare the modules to re-export
pub mod core;
pub mod regions;

// Re-export the types most callers want
pub use crate::core::client::{
    ClientEvent, ClientOptions, EventFilter, IngestError, IngestionClient, ParseErrorKind,
    TransportFactory,
};
pub use crate::core::emitter::{Cancellation, Emitter};
pub use crate::core::event::{GameType, NormalizedEvent};
pub use crate::core::frame_clock::{FrameCallback, FrameClock, ManualFrameClock, TickFrameClock};
pub use crate::core::render_queue::{
    CellSource, CellSpec, RenderEntry, RenderQueue, RenderQueueOptions, Row, RowCell, RowContainer,
};
pub use crate::core::router::{Handler, Router};
pub use crate::core::transport::{
    Frame, ReadyState, ReconnectingTransport, Transport, TransportError, TransportEvent,
    TransportOptions,
};
pub use crate::regions::region_map::{Endian, RegionHit, RegionMap, RegionMapError};
