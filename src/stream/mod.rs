pub mod cancel;
pub mod finalizer;
pub mod multiplexer;
pub mod normalizer;
pub mod pipeline;
pub mod scanner;
pub mod session;
pub mod source;

pub use cancel::{CancellationToken, RequestManager};
pub use finalizer::TranscriptFinalizer;
pub use multiplexer::{EventMultiplexer, WireFrame};
pub use normalizer::normalize;
pub use pipeline::StreamService;
pub use scanner::{MarkerKind, MarkerScanner, ScanContext};
pub use session::{ReaderItem, SessionConfig, SessionManager, SessionReader, StreamSession};
pub use source::{Generator, OllamaSource, ScriptedGenerator, SourceError, SourceItem, TokenSource};
