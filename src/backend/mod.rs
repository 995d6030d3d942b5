//! Device transport variants and the runtime capability probe
//!
//! Backends are selected at runtime, never at compile time: [`probe`] walks
//! the variants in preference order and returns the first whose capability
//! check passes. A missing capability (no native host, no device) simply
//! disables that variant; the loopback sink always remains as the floor.
//!
//! The kernel-direct variant is not probed automatically — it needs an
//! explicit [`PcmPort`](kernel::PcmPort) capability object, resolved once
//! by the embedder.

pub mod kernel;
pub mod loopback;
#[cfg(feature = "cpal-backend")]
pub mod native;

use crate::sink::{Config, DeviceSink, SinkError};

/// Pick the best available transport for `config`
pub fn probe(config: &Config) -> Result<Box<dyn DeviceSink>, SinkError> {
    #[cfg(feature = "cpal-backend")]
    {
        match native::NativeSink::detect(config) {
            Some(sink) => {
                log::info!("using native audio backend");
                return Ok(Box::new(sink));
            }
            None => log::info!("no native audio device, falling back"),
        }
    }
    let _ = config;
    log::info!("using loopback backend");
    Ok(Box::new(loopback::LoopbackSink::new()))
}
