// lens - transparent telemetry proxy for streaming LLM APIs
//
// Architecture:
// - Proxy server (axum): accepts every request and hands it to the wire
// - Wire: forwards upstream, tees the response body to an SSE observer
// - Storage: persists one telemetry event per exchange, out of band
// - Config + logging: layered TOML/env configuration, tracing subscriber

pub mod config;
pub mod events;
pub mod logging;
pub mod proxy;
pub mod storage;
