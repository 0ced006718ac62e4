use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::{
    parse_quantiles,
    registry::{AtomicStorage, GenerationalAtomicStorage, GenerationalStorage, Recency, Registry},
    MetricKindMask, Quantile, Summary,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

pub struct MetricsLogRecorder {
    registry: Arc<Registry<Key, GenerationalAtomicStorage>>,
}

impl Recorder for MetricsLogRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| c.clone().into())
    }
    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.registry
            .get_or_create_gauge(key, |g| Gauge::from_arc(g.clone().into()))
    }
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h| Histogram::from_arc(h.clone().into()))
    }
}

/// Renders the registry on demand, typically once a compile or a search ends.
pub struct MetricsReporter {
    registry: Arc<Registry<Key, GenerationalAtomicStorage>>,
    recency: Recency<Key>,
    quantiles: Vec<Quantile>,
    histogram_summaries: HashMap<String, VecDeque<Summary>>,
    histogram_summary_window: usize,
}

impl MetricsReporter {
    pub fn render(&mut self) -> String {
        let registry = &self.registry;
        let mut metrics_info = String::new();
        metrics_info.push_str("\n=================Metrics=====================\n");
        metrics_info.push_str("Gauges:\n");
        let mut gauges: Vec<_> = registry.get_gauge_handles().into_iter().collect();
        gauges.sort_by(|a, b| a.0.name().cmp(b.0.name()));
        for (key, gauge) in gauges {
            let gen = gauge.get_generation();
            if !self.recency.should_store_gauge(&key, gen, registry) {
                continue;
            }
            let value = f64::from_bits(gauge.get_inner().load(Ordering::Acquire));
            metrics_info.push_str(format!("{}:{}\n", key.name(), value).as_str());
        }

        metrics_info.push_str("\nCounters:\n");
        let mut counters: Vec<_> = registry.get_counter_handles().into_iter().collect();
        counters.sort_by(|a, b| a.0.name().cmp(b.0.name()));
        for (key, counter) in counters {
            let gen = counter.get_generation();
            if !self.recency.should_store_counter(&key, gen, registry) {
                continue;
            }
            let value = counter.get_inner().load(Ordering::Acquire);
            metrics_info.push_str(format!("{}:{}\n", key.name(), value).as_str());
        }

        metrics_info.push_str("\nHistograms:\n");
        let mut histograms: Vec<_> = registry.get_histogram_handles().into_iter().collect();
        histograms.sort_by(|a, b| a.0.name().cmp(b.0.name()));
        for (key, histogram) in histograms {
            let gen = histogram.get_generation();
            if !self.recency.should_store_histogram(&key, gen, registry) {
                continue;
            }
            let name = key.name().to_string();
            let summaries = self.histogram_summaries.entry(name.clone()).or_default();

            let mut summary = Summary::with_defaults();
            histogram.get_inner().clear_with(|values| {
                for v in values {
                    summary.add(*v);
                }
            });
            if summaries.len() >= self.histogram_summary_window {
                summaries.pop_front();
            }
            summaries.push_back(summary);

            let mut sum = Summary::with_defaults();
            for summary in summaries.iter() {
                if let Err(e) = sum.merge(summary) {
                    tracing::warn!("failed to merge summary of {}:{:?}", name, e);
                }
            }
            metrics_info.push_str(format!("{}_count:{}\n", name, sum.count()).as_str());
            for quantile in &self.quantiles {
                if let Some(v) = sum.quantile(quantile.value()) {
                    metrics_info.push_str(format!("{}_{}:{:.4}\n", name, quantile.label(), v).as_str());
                }
            }
        }
        metrics_info
    }

    pub fn report(&mut self) {
        let metrics_info = self.render();
        tracing::info!("{}", metrics_info);
    }
}

pub struct MetricsBuilder {
    quantiles: Vec<Quantile>,
    idle_timeout: Duration,
    histogram_summary_window: usize,
}

impl Default for MetricsBuilder {
    fn default() -> Self {
        MetricsBuilder::new()
    }
}

impl MetricsBuilder {
    pub fn new() -> Self {
        let quantiles = parse_quantiles(&[0.0, 0.5, 0.9, 0.99, 1.0]);
        Self {
            quantiles,
            idle_timeout: Duration::from_secs(300),
            histogram_summary_window: 5,
        }
    }
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
    pub fn with_histogram_summary_window(mut self, window: usize) -> Self {
        self.histogram_summary_window = window.max(1);
        self
    }
    pub fn with_quantiles(mut self, quantiles: &[f64]) -> Self {
        if quantiles.is_empty() {
            return self;
        }
        self.quantiles = parse_quantiles(quantiles);
        self
    }

    /// A recorder and the reporter reading from the same registry.
    pub fn build(self) -> (MetricsLogRecorder, MetricsReporter) {
        let registry = Arc::new(Registry::new(GenerationalStorage::new(AtomicStorage)));
        let recorder = MetricsLogRecorder {
            registry: registry.clone(),
        };
        let reporter = MetricsReporter {
            registry,
            recency: Recency::new(
                quanta::Clock::new(),
                MetricKindMask::ALL,
                Some(self.idle_timeout),
            ),
            quantiles: self.quantiles,
            histogram_summaries: HashMap::new(),
            histogram_summary_window: self.histogram_summary_window,
        };
        (recorder, reporter)
    }

    pub fn install(self) -> anyhow::Result<MetricsReporter> {
        let (recorder, reporter) = self.build();
        metrics::set_global_recorder(recorder).map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(reporter)
    }
}

#[test]
fn test_render_local_metrics() -> anyhow::Result<()> {
    let (recorder, mut reporter) = MetricsBuilder::new().build();
    metrics::with_local_recorder(&recorder, || {
        metrics::counter!("flexpar_search_iterations").increment(3);
        metrics::gauge!("flexpar_best_runtime").set(1.5);
        for v in [1.0, 2.0, 3.0] {
            metrics::histogram!("flexpar_simulated_runtime").record(v);
        }
    });
    let rendered = reporter.render();
    assert!(rendered.contains("flexpar_search_iterations:3"));
    assert!(rendered.contains("flexpar_best_runtime:1.5"));
    assert!(rendered.contains("flexpar_simulated_runtime_count:3"));

    let again = reporter.render();
    assert!(again.contains("flexpar_simulated_runtime_count:3"));
    Ok(())
}
