// Ingestion module
// Decodes transport payloads and buffers samples per device session

pub mod decode;
pub mod session;

pub use decode::{ByteOrder, DecodeError, Sample, SampleDecoder, WireFormat};
pub use session::{IngestOutcome, Session, SessionBuffer, SessionDrain, SessionError, SessionPolicy};
