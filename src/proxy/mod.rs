// Proxy module - transparent tap in front of a streaming LLM API
//
// Every inbound request is forwarded unchanged (minus attribute headers) and
// the streamed response is relayed byte-for-byte. A tee mirrors the response
// into a background observer that parses the SSE stream into a telemetry
// `Event`, which is saved once the stream is done.
//
//   client ─► server ─► Wire::tap ─► Sender ─► upstream
//                          │
//                          └─ TeeBody ─┬─► client
//                                      └─► StreamObserver ─► Saver

pub mod error;
pub mod headers;
pub mod lifecycle;
pub mod sender;
pub mod server;
pub mod sse;
pub mod tee;
pub mod trace;
pub mod types;
pub mod wire;

#[cfg(test)]
pub(crate) mod mock;

pub use error::{LifecycleError, TapError};
pub use sender::{HttpSender, Sender};
pub use server::{router, start_proxy};
pub use wire::{ObserverHandle, Tapped, Wire, WireOptions};
