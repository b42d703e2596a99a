mod component;
mod metrics_sink;

pub use component::Component;
pub use metrics_sink::MetricsSink;
