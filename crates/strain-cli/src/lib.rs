//! HTTP probes, request templates and logging for the `strain` binary.

pub mod http_probe;
pub mod logging;
pub mod template;

pub use http_probe::{HttpProbe, HttpProbeFactory};
pub use logging::{init_logging, LogFormat};
pub use template::{Template, TemplateError};
