/// A sink for named numeric events emitted by the node agent.
///
/// Metric name validation and export mechanics belong to the sink
/// implementation, not to this crate. Tags are `(key, value)` pairs such as
/// the job id or the resource name.
pub trait MetricsSink: Send + Sync + 'static {
    fn counter(&self, name: &str, value: u64, tags: &[(&str, &str)]);
    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]);
}

/// A sink that discards all events.
#[derive(Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn counter(&self, _name: &str, _value: u64, _tags: &[(&str, &str)]) {}

    fn gauge(&self, _name: &str, _value: f64, _tags: &[(&str, &str)]) {}
}
