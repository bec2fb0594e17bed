// Library root
// -----------
// This crate exposes a small library surface for the CLI. The binary
// (`main.rs`) wires these modules together.
//
// Module responsibilities:
// - `api`: the blocking HTTP client for the build server. Owns the
//   session, the crumb handshake and the read-retry policy.
// - `commands`: sequences API calls per command and computes the exit
//   status, including the blocking wait/poll loop.
// - `config`: environment loading with interactive credential fallback.
//
// Keeping this separation means the command layer can be tested against a
// fake API client, and the HTTP client against a local stub server.
pub mod api;
pub mod commands;
pub mod config;
