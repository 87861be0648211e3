// THEORY:
// This file is the main entry point for the `factory_sentinel` library crate.
// It exports `SentinelPipeline` and its configuration as the high-level
// interface, together with the seams (`FrameSource`, `Classifier`, `Speaker`,
// `Notifier`) that binaries implement to connect a real camera, a real
// classification service and real alert transports.
//
// The `core_modules` hold the individual components: the verdict codec, the
// backend selector, the alert dispatcher and the state store shared with
// out-of-process viewers.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;
