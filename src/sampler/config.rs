use std::time::Duration;

use bon::Builder;

/// Options forwarded to the location source when a subscription starts.
#[derive(Debug, Clone, Builder)]
pub struct SamplerOptions {
    /// Request the most accurate fixes the source can provide.
    #[builder(default = true)]
    pub high_accuracy: bool,

    /// Accept cached fixes up to this age.
    pub maximum_age: Option<Duration>,

    /// Report the source as unavailable if no fix arrives within this window.
    pub timeout: Option<Duration>,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}
